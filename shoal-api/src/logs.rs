///! Node log retrieval boundary
///!
///! Log collection itself happens elsewhere; the API only validates the query
///! and hands it to whichever collector is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shoal_common::{Error, HostInfo, Node, Result};

pub const DEFAULT_LOG_LINES: usize = 100;
pub const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Tail,
    Head,
    All,
}

/// Query string of the node log endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
    #[serde(default)]
    pub mode: LogMode,
    pub filter: Option<String>,
    /// Day of a rotated log, `YYYY-MM-DD`
    pub date: Option<String>,
}

impl LogQuery {
    pub fn validate(&self) -> Result<()> {
        if let Some(lines) = self.lines {
            if lines == 0 || lines > MAX_LOG_LINES {
                return Err(Error::Validation(format!(
                    "lines must be between 1 and {}",
                    MAX_LOG_LINES
                )));
            }
        }
        if let Some(date) = &self.date {
            chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|_| Error::Validation(format!("Invalid date '{}', expected YYYY-MM-DD", date)))?;
        }
        Ok(())
    }

    pub fn effective_lines(&self) -> usize {
        self.lines.unwrap_or(DEFAULT_LOG_LINES)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLogs {
    pub node_id: i64,
    pub host_id: i64,
    pub lines: Vec<String>,
}

#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn collect(&self, node: &Node, host: Option<&HostInfo>, query: &LogQuery) -> Result<NodeLogs>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_validation() {
        assert!(LogQuery::default().validate().is_ok());
        assert_eq!(LogQuery::default().effective_lines(), DEFAULT_LOG_LINES);

        let too_many = LogQuery {
            lines: Some(MAX_LOG_LINES + 1),
            ..Default::default()
        };
        assert!(too_many.validate().is_err());

        let bad_date = LogQuery {
            date: Some("18/10/2026".to_string()),
            ..Default::default()
        };
        assert!(bad_date.validate().is_err());

        let good_date = LogQuery {
            date: Some("2026-10-18".to_string()),
            mode: LogMode::Head,
            ..Default::default()
        };
        assert!(good_date.validate().is_ok());
    }
}
