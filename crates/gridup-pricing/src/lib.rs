//! gridup-pricing — instance pricing catalog.
//!
//! Hourly instance prices back the cost-based scorers. Catalogs for the
//! supported providers are embedded in the binary; an operator can point
//! the daemon at a JSON file to override them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use gridup_core::NodePool;

const AWS_PRICING: &str = include_str!("../assets/aws_pricing_eu-west-1.json");
const GCP_PRICING: &str = include_str!("../assets/gcp_pricing_eu-west1.json");

pub type PricingResult<T> = Result<T, PricingError>;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("failed to read pricing file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse pricing data: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Hourly prices for one instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePricing {
    pub instance_type: String,
    pub on_demand: f64,
    #[serde(default)]
    pub reserved_3_yr: f64,
}

#[derive(Debug, Deserialize)]
struct PricingDocument {
    results: Vec<InstancePricing>,
}

/// Lookup table from instance type to hourly prices.
#[derive(Debug, Clone, Default)]
pub struct PricingCatalog {
    prices: HashMap<String, InstancePricing>,
}

impl PricingCatalog {
    /// Load the embedded catalog for a provider (`aws` or `gcp`).
    pub fn builtin(provider: &str) -> PricingResult<Self> {
        let raw = match provider {
            "aws" => AWS_PRICING,
            "gcp" => GCP_PRICING,
            other => return Err(PricingError::UnsupportedProvider(other.to_string())),
        };
        let catalog = Self::from_json(raw)?;
        debug!(provider, entries = catalog.prices.len(), "pricing catalog loaded");
        Ok(catalog)
    }

    /// Load a catalog from an operator-supplied JSON file.
    pub fn from_json_file(path: &Path) -> PricingResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| PricingError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    fn from_json(raw: &str) -> PricingResult<Self> {
        let doc: PricingDocument = serde_json::from_str(raw)?;
        let prices = doc
            .results
            .into_iter()
            .map(|p| (p.instance_type.clone(), p))
            .collect();
        Ok(PricingCatalog { prices })
    }

    /// Hourly on-demand price for an instance type, if known.
    pub fn on_demand(&self, instance_type: &str) -> Option<f64> {
        self.prices.get(instance_type).map(|p| p.on_demand)
    }

    /// Hourly 3-year-reserved price for an instance type, if known.
    pub fn reserved_3yr(&self, instance_type: &str) -> Option<f64> {
        self.prices.get(instance_type).map(|p| p.reserved_3_yr)
    }

    /// On-demand price per instance type for the given pools.
    /// Unknown instance types map to 0.
    pub fn costs_for_pools(&self, pools: &[NodePool]) -> HashMap<String, f64> {
        pools
            .iter()
            .map(|np| {
                (
                    np.instance_type.clone(),
                    self.on_demand(&np.instance_type).unwrap_or(0.0),
                )
            })
            .collect()
    }

    /// Each pool instance type's share of the summed on-demand price.
    /// All ratios are 0 when no pool has a known price.
    pub fn cost_ratios_for_pools(&self, pools: &[NodePool]) -> HashMap<String, f64> {
        let costs = self.costs_for_pools(pools);
        let total: f64 = costs.values().sum();
        costs
            .into_iter()
            .map(|(instance_type, price)| {
                let ratio = if total > 0.0 { price / total } else { 0.0 };
                (instance_type, ratio)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pool(name: &str, instance_type: &str) -> NodePool {
        NodePool {
            name: name.to_string(),
            zones: BTreeSet::from(["eu-west-1a".to_string()]),
            max: 3,
            current: 0,
            instance_type: instance_type.to_string(),
        }
    }

    #[test]
    fn builtin_aws_catalog_has_m5_family() {
        let catalog = PricingCatalog::builtin("aws").unwrap();
        let large = catalog.on_demand("m5.large").unwrap();
        let xlarge4 = catalog.on_demand("m5.4xlarge").unwrap();
        assert!(large > 0.0);
        // Pricing scales linearly with instance size.
        assert!((xlarge4 / large - 8.0).abs() < 0.01);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        assert!(matches!(
            PricingCatalog::builtin("azure"),
            Err(PricingError::UnsupportedProvider(_))
        ));
    }

    #[test]
    fn unknown_instance_type_is_none() {
        let catalog = PricingCatalog::builtin("aws").unwrap();
        assert_eq!(catalog.on_demand("quantum.9000xlarge"), None);
    }

    #[test]
    fn cost_ratios_sum_to_one() {
        let catalog = PricingCatalog::builtin("aws").unwrap();
        let pools = vec![pool("p1", "m5.large"), pool("p2", "m5.4xlarge")];
        let ratios = catalog.cost_ratios_for_pools(&pools);
        let sum: f64 = ratios.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(ratios["m5.large"] < ratios["m5.4xlarge"]);
    }

    #[test]
    fn cost_ratios_zero_when_all_unknown() {
        let catalog = PricingCatalog::builtin("aws").unwrap();
        let pools = vec![pool("p1", "mystery.large")];
        let ratios = catalog.cost_ratios_for_pools(&pools);
        assert_eq!(ratios["mystery.large"], 0.0);
    }
}
