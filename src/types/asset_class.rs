use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::error::Error;

/// Partition key for symbols, queues, fetch schedules and metrics runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Crypto,
    Equity,
    Commodity,
    Bond,
}

impl AssetClass {
    pub const ALL: [AssetClass; 4] = [
        AssetClass::Crypto,
        AssetClass::Equity,
        AssetClass::Commodity,
        AssetClass::Bond,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Crypto => "crypto",
            AssetClass::Equity => "equity",
            AssetClass::Commodity => "commodity",
            AssetClass::Bond => "bond",
        }
    }

    /// Routing key used when publishing quotes of this class.
    pub fn routing_key(&self) -> String {
        format!("{}.ticker", self.as_str())
    }

    /// Binding pattern of the per-class ETL queue.
    pub fn binding_pattern(&self) -> String {
        format!("{}.*", self.as_str())
    }

    pub fn queue_name(&self) -> String {
        format!("etl.{}.queue", self.as_str())
    }

    pub fn metrics_job_type(&self) -> String {
        format!("metrics_{}", self.as_str())
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crypto" => Ok(AssetClass::Crypto),
            "equity" => Ok(AssetClass::Equity),
            "commodity" => Ok(AssetClass::Commodity),
            "bond" => Ok(AssetClass::Bond),
            other => Err(Error::UnknownAssetClass(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_names_are_class_scoped() {
        assert_eq!(AssetClass::Crypto.routing_key(), "crypto.ticker");
        assert_eq!(AssetClass::Bond.binding_pattern(), "bond.*");
        assert_eq!(AssetClass::Equity.queue_name(), "etl.equity.queue");
        assert_eq!(AssetClass::Commodity.metrics_job_type(), "metrics_commodity");
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Crypto".parse::<AssetClass>().unwrap(), AssetClass::Crypto);
        assert!(matches!(
            "forex".parse::<AssetClass>(),
            Err(Error::UnknownAssetClass(_))
        ));
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&AssetClass::Equity).unwrap();
        assert_eq!(json, "\"equity\"");
    }
}
