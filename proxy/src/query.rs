//! InfluxQL statement classification for query routing.
//!
//! The proxy never evaluates a query; it only needs to know which statement
//! family it is looking at, which measurement it touches (to resolve the
//! ring owner) and which database an `ON` clause names. Everything else is
//! forwarded verbatim.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query not found")]
    EmptyQuery,

    #[error("illegal query")]
    IllegalQuery,

    #[error("database not found")]
    DatabaseNotFound,

    #[error("database forbidden: {0}")]
    Forbidden(String),

    #[error("measurement not found in query")]
    MeasurementNotFound,

    #[error("no healthy backend to serve the query")]
    NoHealthyBackend,

    #[error(transparent)]
    Client(#[from] backend::ClientError),
}

/// Statement families the proxy routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// `SELECT ... FROM m ...` - read, routed to one healthy holder.
    SelectFrom,
    /// `SHOW ...` - metadata read, routed to one healthy backend.
    Show,
    /// `DELETE FROM m` / `DROP MEASUREMENT m` - fanned out to all replicas.
    DeleteOrDrop,
    /// `CREATE|ALTER|DROP RETENTION POLICY` / `ALTER ...` - all backends.
    Alter,
}

#[derive(Debug)]
pub struct ParsedQuery {
    pub kind: QueryKind,
    /// Measurement named by a FROM clause or DROP MEASUREMENT.
    pub measurement: Option<String>,
    /// Database named by an ON clause.
    pub db: Option<String>,
    /// True for `SHOW DATABASES`, which needs no database context.
    pub show_databases: bool,
}

/// Classify one statement. Multi-statement requests are not supported and
/// classify as illegal.
pub fn parse(q: &str) -> Result<ParsedQuery, QueryError> {
    let q = q.trim().trim_end_matches(';').trim();
    if q.is_empty() {
        return Err(QueryError::EmptyQuery);
    }
    if q.contains(';') {
        return Err(QueryError::IllegalQuery);
    }

    let tokens = tokenize(q);
    if tokens.is_empty() {
        return Err(QueryError::EmptyQuery);
    }
    let lower: Vec<String> = tokens.iter().map(|t| t.to_ascii_lowercase()).collect();

    let kind = match lower[0].as_str() {
        "select" => {
            if lower.iter().any(|t| t == "from") {
                QueryKind::SelectFrom
            } else {
                return Err(QueryError::IllegalQuery);
            }
        }
        "show" => QueryKind::Show,
        "delete" => QueryKind::DeleteOrDrop,
        "drop" if lower.get(1).map(String::as_str) == Some("measurement") => {
            QueryKind::DeleteOrDrop
        }
        "alter" => QueryKind::Alter,
        "create" | "drop" if lower.get(1).map(String::as_str) == Some("retention") => {
            QueryKind::Alter
        }
        _ => return Err(QueryError::IllegalQuery),
    };

    let measurement = token_after(&tokens, &lower, "from")
        .or_else(|| token_after(&tokens, &lower, "measurement"))
        .map(clean_measurement);
    let db = token_after(&tokens, &lower, "on").map(|t| clean_ident(&t));
    let show_databases =
        kind == QueryKind::Show && lower.get(1).map(String::as_str) == Some("databases");

    Ok(ParsedQuery {
        kind,
        measurement,
        db,
        show_databases,
    })
}

/// Split a statement into tokens, keeping double-quoted identifiers (which
/// may contain spaces) intact.
fn tokenize(q: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in q.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn token_after(tokens: &[String], lower: &[String], keyword: &str) -> Option<String> {
    lower
        .iter()
        .position(|t| t == keyword)
        .and_then(|i| tokens.get(i + 1))
        .cloned()
}

/// Strip a `db.rp.` prefix and surrounding quotes from a measurement token.
fn clean_measurement(token: String) -> String {
    let token = token.trim_end_matches(',');
    let segment = if token.contains('.') && !token.starts_with('"') {
        token.rsplit('.').next().unwrap_or(token)
    } else {
        token
    };
    clean_ident(segment)
}

fn clean_ident(token: &str) -> String {
    token.trim_matches('"').to_string()
}
