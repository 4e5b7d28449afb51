use stockwise_core::Value;

/// Parameterised predicate list joined with `AND`. Column names are compile-time
/// constants; every value travels as a bound `?` parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.compare(column, "=", value)
    }

    pub fn gt(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.compare(column, ">", value)
    }

    pub fn between(
        mut self,
        column: &'static str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.predicates.push(format!("{column} BETWEEN ? AND ?"));
        self.params.push(low.into());
        self.params.push(high.into());
        self
    }

    pub fn in_list<I, V>(mut self, column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.predicates.push("1 = 0".to_string());
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.predicates.push(format!("{column} IN ({placeholders})"));
        self.params.extend(values);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    fn compare(mut self, column: &'static str, op: &str, value: impl Into<Value>) -> Self {
        self.predicates.push(format!("{column} {op} ?"));
        self.params.push(value.into());
        self
    }

    fn into_parts(self) -> (String, Vec<Value>) {
        (self.predicates.join(" AND "), self.params)
    }
}

/// A source `SELECT` with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    label: &'static str,
    sql: String,
    params: Vec<Value>,
}

impl SelectQuery {
    pub fn new(label: &'static str, sql: impl Into<String>) -> Self {
        Self {
            label,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// `base WHERE <filter> [ORDER BY order_by]`.
    pub fn filtered(
        label: &'static str,
        base: &str,
        filter: Filter,
        order_by: Option<&'static str>,
    ) -> Self {
        let mut sql = base.trim().to_string();
        let (predicate, params) = filter.into_parts();
        if !predicate.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        Self { label, sql, params }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}
