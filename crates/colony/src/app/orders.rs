use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use construction::{ConstructionRequest, IntVec3, MaterialStore, SettlementId, WorldId};
use serde::Deserialize;
use thiserror::Error;

/// Scripted input for a headless run: settlement stocks, chunk streaming,
/// and construction orders keyed by the tick they are issued on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Scenario {
    #[serde(default)]
    pub(crate) settlements: Vec<SettlementSeed>,
    /// Worlds listed here start with nothing loaded. Unlisted worlds are
    /// fully loaded.
    #[serde(default)]
    pub(crate) streamed_worlds: Vec<WorldId>,
    #[serde(default)]
    pub(crate) area_loads: Vec<AreaLoad>,
    #[serde(default)]
    pub(crate) orders: Vec<Order>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SettlementSeed {
    pub(crate) id: SettlementId,
    #[serde(default)]
    pub(crate) store: MaterialStore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AreaLoad {
    pub(crate) at_tick: u64,
    #[serde(default)]
    pub(crate) world_id: WorldId,
    pub(crate) from: IntVec3,
    pub(crate) to: IntVec3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Order {
    #[serde(default)]
    pub(crate) at_tick: u64,
    pub(crate) request: ConstructionRequest,
    /// Absolute tick on which the resulting building is cancelled.
    #[serde(default)]
    pub(crate) cancel_at_tick: Option<u64>,
}

#[derive(Debug, Error)]
pub(crate) enum OrdersError {
    #[error("failed to read orders {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse orders json at {field}: {message}")]
    Parse { field: String, message: String },
    #[error("order {index} cancels at tick {cancel_at_tick}, before it is issued at {at_tick}")]
    CancelBeforeIssue {
        index: usize,
        at_tick: u64,
        cancel_at_tick: u64,
    },
    #[error("settlement {settlement_id} is listed twice")]
    DuplicateSettlement { settlement_id: SettlementId },
}

impl Scenario {
    pub(crate) fn parse(raw: &str) -> Result<Self, OrdersError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let scenario =
            serde_path_to_error::deserialize::<_, Self>(&mut deserializer).map_err(|error| {
                let field = match error.path().to_string() {
                    path if path.is_empty() || path == "." => "<root>".to_string(),
                    path => path,
                };
                OrdersError::Parse {
                    field,
                    message: error.into_inner().to_string(),
                }
            })?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// A missing file is an empty scenario.
    pub(crate) fn load_or_empty(path: &Path) -> Result<Self, OrdersError> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(OrdersError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub(crate) fn last_scripted_tick(&self) -> u64 {
        let orders = self
            .orders
            .iter()
            .map(|order| order.cancel_at_tick.unwrap_or(order.at_tick));
        let loads = self.area_loads.iter().map(|load| load.at_tick);
        orders.chain(loads).max().unwrap_or(0)
    }

    fn validate(&self) -> Result<(), OrdersError> {
        for (index, order) in self.orders.iter().enumerate() {
            if let Some(cancel_at_tick) = order.cancel_at_tick {
                if cancel_at_tick < order.at_tick {
                    return Err(OrdersError::CancelBeforeIssue {
                        index,
                        at_tick: order.at_tick,
                        cancel_at_tick,
                    });
                }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for seed in &self.settlements {
            if !seen.insert(seed.id) {
                return Err(OrdersError::DuplicateSettlement {
                    settlement_id: seed.id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use construction::{BlueprintId, ResourceKind};
    use tempfile::TempDir;

    use super::*;

    const SAMPLE: &str = r#"{
        "settlements": [ { "id": 1, "store": { "cobblestone": 40, "oak_planks": 12 } } ],
        "streamed_worlds": [1],
        "area_loads": [ { "at_tick": 30, "world_id": 1, "from": { "x": 0, "y": 0, "z": 0 }, "to": { "x": 15, "y": 0, "z": 15 } } ],
        "orders": [
            { "at_tick": 1, "request": { "blueprint_ref": "walls/short", "anchor_position": { "x": 0, "y": 64, "z": 0 }, "rotation": 90, "settlement_ref": 1 } },
            { "at_tick": 5, "cancel_at_tick": 20, "request": { "blueprint_ref": "huts/small", "anchor_position": { "x": 4, "y": 64, "z": 4 }, "rotation": 0, "settlement_ref": 1, "world_id": 1 } }
        ]
    }"#;

    #[test]
    fn parses_sample_scenario() {
        let scenario = Scenario::parse(SAMPLE).expect("parse");
        assert_eq!(scenario.settlements.len(), 1);
        assert_eq!(
            scenario.settlements[0]
                .store
                .quantity(&ResourceKind::new("cobblestone")),
            40
        );
        assert_eq!(scenario.streamed_worlds, vec![WorldId(1)]);
        assert_eq!(scenario.orders[0].request.blueprint_ref, BlueprintId::new("walls/short"));
        assert_eq!(scenario.orders[1].request.world_id, WorldId(1));
        assert_eq!(scenario.last_scripted_tick(), 30);
    }

    #[test]
    fn parse_errors_name_the_field() {
        let error = Scenario::parse(r#"{ "orders": [ { "at_tick": "soon" } ] }"#)
            .expect_err("bad tick");
        assert!(error.to_string().contains("orders[0].at_tick"), "{error}");
    }

    #[test]
    fn rejects_cancel_before_issue_and_duplicate_settlements() {
        let early = r#"{ "orders": [ { "at_tick": 9, "cancel_at_tick": 3, "request": {
            "blueprint_ref": "a", "anchor_position": { "x": 0, "y": 0, "z": 0 },
            "rotation": 0, "settlement_ref": 1 } } ] }"#;
        assert!(matches!(
            Scenario::parse(early),
            Err(OrdersError::CancelBeforeIssue { index: 0, .. })
        ));

        let twice = r#"{ "settlements": [ { "id": 2 }, { "id": 2 } ] }"#;
        assert!(matches!(
            Scenario::parse(twice),
            Err(OrdersError::DuplicateSettlement { .. })
        ));
    }

    #[test]
    fn missing_file_is_empty() {
        let temp = TempDir::new().expect("temp");
        let scenario = Scenario::load_or_empty(&temp.path().join("orders.json")).expect("load");
        assert!(scenario.orders.is_empty());
        assert_eq!(scenario.last_scripted_tick(), 0);
    }
}
