use async_trait::async_trait;
use chrono::NaiveDate;
use stockwise_core::{
    ConsumptionRow, MovementHeader, MovementLine, MovementRow, StockMasterRow, Window,
};
use tracing::debug;

use crate::{
    EndpointSwitch, Filter, SelectQuery, SourceClient, SourceEndpoint, SourceError, SourceRow,
};

const ACTIVE_STATUSES: [&str; 3] = ["Aktif", "Sipar", "Son"];
const CONSUMPTION_DOCUMENT_TYPES: [i64; 2] = [21, 22];
const MOVEMENT_DOCUMENT_TYPES: [i64; 2] = [50, 51];
const OPEN_ORDER_DOCUMENT_TYPE: i64 = 10;
const OPEN_ORDER_STATUS: i64 = 34;

/// Production documents dated on or before this day predate the current BOM model.
fn consumption_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 12, 31).unwrap_or(NaiveDate::MIN)
}

const CONSUMPTION_DETAIL_SQL: &str = r#"
SELECT
    h.H_ID,
    h.TARIH,
    h.FIRMA,
    h.TIPI,
    r.URUN,
    r.TURU,
    r.BIRIM,
    CASE
        WHEN r.RMEK IN ('5019', 'Z5004', 'Z5005', 'Z5016', 'Z5017', 'Z5018', 'Z5019')
         AND r.URUN = 'KUMAŞ'
        THEN r.MIKTAR * 2
        ELSE r.MIKTAR
    END,
    r.RITEM
FROM HAREKETLER h
JOIN (
    SELECT ANAGRUP, URUN, TURU, SBUP_ADI, SUM(MIKTAR) AS MIKTAR, BIRIM,
           MAX(RMEK) AS RMEK, MAX(RITEM) AS RITEM, HSID
    FROM RECETE_STORSCREEN(?)
    GROUP BY ANAGRUP, URUN, TURU, SBUP_ADI, BIRIM, HSID
) r ON 1 = 1
WHERE h.H_ID = ?
"#;

const MOVEMENT_HEADER_COLUMNS: &str = "SELECT H_ID, TARIH, TIPI, DURUM, FIRMA, REF_HID FROM HAREKETLER";

const MOVEMENT_LINES_SQL: &str = r#"
SELECT hs.HS_ID, hs.H_ID, hs.URUN_TURU, hs.URUN_KODU, hs.BIRIM, hs.TOPLAM_MIKTAR,
       sk.TURU2, sk.TURU3
FROM HAREKET_SATIR hs
LEFT JOIN STOK_KARTI sk ON sk.ADI = hs.URUN_KODU
"#;

const OPEN_ORDERS_SQL: &str = r#"
SELECT h.H_ID, hs.HS_ID, h.TARIH, h.FIRMA, h.TIPI, h.DURUM,
       hs.URUN_TURU, hs.URUN_KODU, s.TURU2, s.TURU3, hs.BIRIM, hs.TOPLAM_MIKTAR
FROM HAREKETLER h
JOIN HAREKET_SATIR hs ON hs.H_ID = h.H_ID
JOIN STOK_TURLER t ON t.ADI = hs.URUN_TURU
JOIN STOK_KARTI s ON t.S_ID = s.S_ID
"#;

const STOCK_MASTER_SQL: &str = r#"
SELECT sk.s_id, t.adi, t.renk_id, t.aciklama, t.eni, t.boyu, t.agirlik, t.ana_tur,
       t.tedarikci_1, t.tedarikci_2, t.tedarikci_3, t.tedarikci_4, t.tedarikci_5,
       t.recete_1, t.recete_2, t.recete_3, t.recete_4, t.recete_5, t.recete_6, t.recete_7,
       t.katolog, t.kumas_en, t.kumas_boy, t.sure_1, t.sure_2, t.ek_1, t.ek_2, t.ek_3,
       sk.tam_adi, sk.ana_grup, sk.alt_grup, sk.birim, sk.turu, sk.turu3
FROM stok_karti sk
JOIN stok_turler t ON sk.s_id = t.s_id
"#;

/// Typed access to the legacy source. Implemented over ODBC by [`LegacySource`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait SourceSystem: EndpointSwitch + Send {
    fn active_endpoint(&self) -> SourceEndpoint;

    /// Drops the cached connection; the next call reconnects.
    fn invalidate(&mut self);

    async fn reconnect(&mut self) -> Result<(), SourceError>;

    async fn ping(&mut self) -> Result<(), SourceError>;

    async fn consumption_keys(&mut self, window: &Window) -> Result<Vec<i64>, SourceError>;

    async fn consumption_keys_since(&mut self, after: i64) -> Result<Vec<i64>, SourceError>;

    async fn consumption_rows(&mut self, key: i64) -> Result<Vec<ConsumptionRow>, SourceError>;

    async fn movement_headers(&mut self, window: &Window)
        -> Result<Vec<MovementHeader>, SourceError>;

    /// Movement documents with an identifier above `after`, ascending.
    async fn changed_movement_keys(&mut self, after: i64) -> Result<Vec<i64>, SourceError>;

    /// `None` when the document is no longer in an active status.
    async fn movement_header(&mut self, key: i64) -> Result<Option<MovementHeader>, SourceError>;

    async fn movement_lines(&mut self, key: i64) -> Result<Vec<MovementLine>, SourceError>;

    async fn open_orders(&mut self) -> Result<Vec<MovementRow>, SourceError>;

    async fn stock_master(&mut self) -> Result<Vec<StockMasterRow>, SourceError>;
}

/// The Firebird-backed production/warehouse database.
pub struct LegacySource {
    client: SourceClient,
}

impl LegacySource {
    pub fn new(client: SourceClient) -> Self {
        Self { client }
    }

    fn keys(rows: &[SourceRow]) -> Result<Vec<i64>, SourceError> {
        let mut keys = rows
            .iter()
            .map(|row| row.key(0, "H_ID"))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    fn header(row: &SourceRow) -> Result<MovementHeader, SourceError> {
        Ok(MovementHeader {
            h_id: row.key(0, "H_ID")?,
            transaction_date: row.date(1),
            document_type: row.text(2),
            status: row.text(3),
            company_code: row.text(4),
            ref_hid: row.int(5),
        })
    }

    fn active_movements() -> Filter {
        Filter::new()
            .in_list("HTIPI", MOVEMENT_DOCUMENT_TYPES)
            .in_list("DURUM", ACTIVE_STATUSES)
    }

    fn active_consumption() -> Filter {
        Filter::new()
            .gt("TARIH", consumption_cutoff())
            .in_list("DURUM", ACTIVE_STATUSES)
            .in_list("HTIPI", CONSUMPTION_DOCUMENT_TYPES)
    }
}

impl EndpointSwitch for LegacySource {
    fn switch_endpoint(&mut self, endpoint: SourceEndpoint) -> SourceEndpoint {
        self.client.switch_endpoint(endpoint)
    }
}

#[async_trait]
impl SourceSystem for LegacySource {
    fn active_endpoint(&self) -> SourceEndpoint {
        self.client.endpoint()
    }

    fn invalidate(&mut self) {
        self.client.invalidate();
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        self.client.invalidate();
        self.client.ensure().await.map(|_| ())
    }

    async fn ping(&mut self) -> Result<(), SourceError> {
        let rows = self
            .client
            .select_all(&SelectQuery::new("ping", "SELECT 1 FROM RDB$DATABASE"))
            .await?;
        match rows.first().and_then(|row| row.int(0)) {
            Some(1) => Ok(()),
            other => Err(SourceError::rejected(format!(
                "unexpected ping result {other:?}"
            ))),
        }
    }

    async fn consumption_keys(&mut self, window: &Window) -> Result<Vec<i64>, SourceError> {
        let query = SelectQuery::filtered(
            "consumption_keys",
            "SELECT H_ID FROM HAREKETLER",
            Self::active_consumption().between("TARIH", window.start, window.end),
            Some("H_ID"),
        );
        let rows = self.client.select_all(&query).await?;
        Self::keys(&rows)
    }

    async fn consumption_keys_since(&mut self, after: i64) -> Result<Vec<i64>, SourceError> {
        let query = SelectQuery::filtered(
            "consumption_keys_since",
            "SELECT H_ID FROM HAREKETLER",
            Self::active_consumption().gt("H_ID", after),
            Some("H_ID"),
        );
        let rows = self.client.select_all(&query).await?;
        Self::keys(&rows)
    }

    async fn consumption_rows(&mut self, key: i64) -> Result<Vec<ConsumptionRow>, SourceError> {
        let query = SelectQuery::new("consumption_rows", CONSUMPTION_DETAIL_SQL)
            .bind(key)
            .bind(key);
        let rows = self.client.select_all(&query).await?;
        debug!(key, rows = rows.len(), "fetched consumption detail");

        rows.iter()
            .map(|row| -> Result<ConsumptionRow, SourceError> {
                Ok(ConsumptionRow {
                    h_id: row.key(0, "H_ID")?,
                    transaction_date: row.date(1),
                    company_code: row.text(2),
                    document_type: row.text(3),
                    material_category: row.text(4),
                    material_name: row.text(5),
                    unit_of_measure: row.text(6),
                    quantity: row.quantity(7),
                    item_no: row.text(8),
                    material_color: None,
                })
            })
            .collect()
    }

    async fn movement_headers(
        &mut self,
        window: &Window,
    ) -> Result<Vec<MovementHeader>, SourceError> {
        let query = SelectQuery::filtered(
            "movement_headers",
            MOVEMENT_HEADER_COLUMNS,
            Self::active_movements().between("TARIH", window.start, window.end),
            Some("TARIH, H_ID"),
        );
        let rows = self.client.select_all(&query).await?;
        rows.iter().map(Self::header).collect()
    }

    async fn changed_movement_keys(&mut self, after: i64) -> Result<Vec<i64>, SourceError> {
        let query = SelectQuery::filtered(
            "changed_movement_keys",
            "SELECT DISTINCT H_ID FROM HAREKETLER",
            Self::active_movements().gt("H_ID", after),
            Some("H_ID"),
        );
        let rows = self.client.select_all(&query).await?;
        Self::keys(&rows)
    }

    async fn movement_header(&mut self, key: i64) -> Result<Option<MovementHeader>, SourceError> {
        let query = SelectQuery::filtered(
            "movement_header",
            MOVEMENT_HEADER_COLUMNS,
            Filter::new()
                .eq("H_ID", key)
                .in_list("DURUM", ACTIVE_STATUSES),
            None,
        );
        let rows = self.client.select_all(&query).await?;
        rows.first().map(Self::header).transpose()
    }

    async fn movement_lines(&mut self, key: i64) -> Result<Vec<MovementLine>, SourceError> {
        let query = SelectQuery::filtered(
            "movement_lines",
            MOVEMENT_LINES_SQL,
            Filter::new().eq("hs.H_ID", key),
            None,
        );
        let policy = self.client.config().line_retry;
        let rows = self.client.select_with(&query, policy).await?;

        rows.iter()
            .map(|row| -> Result<MovementLine, SourceError> {
                Ok(MovementLine {
                    hs_id: row.int(0),
                    h_id: row.key(1, "H_ID")?,
                    material_name: row.text(2),
                    material_label: row.text(3),
                    unit_of_measure: row.text(4),
                    quantity: row.quantity(5),
                    material_category: row.text(6),
                    item_no: row.text(7),
                })
            })
            .collect()
    }

    async fn open_orders(&mut self) -> Result<Vec<MovementRow>, SourceError> {
        let query = SelectQuery::filtered(
            "open_orders",
            OPEN_ORDERS_SQL,
            Filter::new()
                .eq("h.HTIPI", OPEN_ORDER_DOCUMENT_TYPE)
                .eq("h.HDURUM", OPEN_ORDER_STATUS),
            None,
        );
        let rows = self.client.select_all(&query).await?;

        rows.iter()
            .map(|row| -> Result<MovementRow, SourceError> {
                Ok(MovementRow {
                    h_id: row.key(0, "H_ID")?,
                    ref_hid: None,
                    hs_id: row.int(1),
                    transaction_date: row.date(2),
                    company_code: row.text(3),
                    document_type: row.text(4),
                    movement_status: row.text(5),
                    material_name: row.text(6),
                    material_label: row.text(7),
                    material_category: row.text(8),
                    item_no: row.text(9),
                    unit_of_measure: row.text(10),
                    quantity: row.quantity(11),
                })
            })
            .collect()
    }

    async fn stock_master(&mut self) -> Result<Vec<StockMasterRow>, SourceError> {
        let rows = self
            .client
            .select_all(&SelectQuery::new("stock_master", STOCK_MASTER_SQL))
            .await?;
        let total = rows.len();
        let kept: Vec<StockMasterRow> = rows
            .into_iter()
            .filter_map(|row| StockMasterRow::from_values(row.0))
            .collect();
        debug!(total, kept = kept.len(), "fetched stock master");
        Ok(kept)
    }
}
