use std::sync::OnceLock;

use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::parameter::InputParameter;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, IntoParameter, Nullable};
use stockwise_core::Value;

use crate::{SelectQuery, SourceConnection, SourceConnector, SourceError, SourceRow};

const FETCH_ROWS: usize = 1000;
const MAX_TEXT_LEN: usize = 4096;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

fn environment() -> Result<&'static Environment, SourceError> {
    if let Some(env) = ENVIRONMENT.get() {
        return Ok(env);
    }
    let env = Environment::new()
        .map_err(|err| SourceError::Unsupported(format!("ODBC environment unavailable: {err}")))?;
    Ok(ENVIRONMENT.get_or_init(|| env))
}

/// Connects through the system ODBC driver manager. Every column is fetched as text and
/// coerced by the row decoders.
#[derive(Debug, Default)]
pub struct OdbcConnector;

#[async_trait]
impl SourceConnector for OdbcConnector {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn SourceConnection>, SourceError> {
        let connection = environment()?
            .connect_with_connection_string(connection_string, ConnectionOptions::default())
            .map_err(|err| SourceError::query(err.to_string()))?;
        Ok(Box::new(OdbcConnection { connection }))
    }
}

struct OdbcConnection {
    connection: Connection<'static>,
}

fn to_parameter(value: &Value) -> Box<dyn InputParameter> {
    match value {
        Value::Null => Box::new(Nullable::<i64>::null()),
        Value::Int(v) => Box::new(*v),
        Value::Float(v) => Box::new(*v),
        Value::Text(v) => Box::new(v.clone().into_parameter()),
        Value::Date(v) => Box::new(v.format("%Y-%m-%d").to_string().into_parameter()),
    }
}

impl OdbcConnection {
    fn run(&self, query: &SelectQuery) -> Result<Vec<SourceRow>, odbc_api::Error> {
        let params: Vec<Box<dyn InputParameter>> = query.params().iter().map(to_parameter).collect();
        let mut rows = Vec::new();

        let Some(mut cursor) = self.connection.execute(query.sql(), &params[..])? else {
            return Ok(rows);
        };
        let mut buffer = TextRowSet::for_cursor(FETCH_ROWS, &mut cursor, Some(MAX_TEXT_LEN))?;
        let mut row_set = cursor.bind_buffer(&mut buffer)?;

        while let Some(batch) = row_set.fetch()? {
            for row_index in 0..batch.num_rows() {
                let values = (0..batch.num_cols())
                    .map(|col_index| match batch.at(col_index, row_index) {
                        Some(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(SourceRow(values));
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl SourceConnection for OdbcConnection {
    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<SourceRow>, SourceError> {
        self.run(query)
            .map_err(|err| SourceError::query(format!("{}: {err}", query.label())))
    }
}
