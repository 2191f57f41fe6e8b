// =====================================================================================
// STATUS AGGREGATION ENGINE
// =====================================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::carrier::{reachable_carriers, CarrierHierarchy, CarrierId, CarrierKind};
use crate::models::{StatusHistogram, StatusState};
use crate::services::store::StatusStore;
use crate::StatusError;

pub struct AggregationEngine {
    store: Arc<dyn StatusStore>,
    hierarchy: Arc<dyn CarrierHierarchy>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn StatusStore>, hierarchy: Arc<dyn CarrierHierarchy>) -> Self {
        Self { store, hierarchy }
    }

    /// Histogram of the current state of every enabled status attached to `carrier` or
    /// anything below it. Statuses are fetched in one batch for the whole visit set.
    #[instrument(skip(self))]
    pub async fn aggregate(
        &self,
        carrier: CarrierId,
        include_deployments: bool,
    ) -> Result<StatusHistogram, StatusError> {
        let visit = reachable_carriers(self.hierarchy.as_ref(), carrier, include_deployments).await;
        let statuses = self.store.find_by_carriers(&visit).await?;

        let mut histogram = StatusHistogram::default();
        for status in statuses.iter().filter(|status| status.enabled) {
            histogram.record(status.state());
        }

        debug!(carriers = visit.len(), total = histogram.total(), "Aggregated carrier status");
        Ok(histogram)
    }

    /// One histogram per carrier of `kind`, keyed by its display code. All statuses are
    /// read once and shared across the carriers. Distinct carriers sharing a display code
    /// are merged under that key.
    #[instrument(skip(self))]
    pub async fn aggregate_for_kind(
        &self,
        kind: CarrierKind,
        include_deployments: bool,
    ) -> Result<BTreeMap<String, StatusHistogram>, StatusError> {
        let carriers = self.hierarchy.carriers_of_kind(kind).await;

        let mut states_by_carrier: HashMap<CarrierId, Vec<StatusState>> = HashMap::new();
        for status in self.store.find_all().await? {
            if status.enabled {
                states_by_carrier
                    .entry(status.context)
                    .or_default()
                    .push(status.state());
            }
        }

        let mut result: BTreeMap<String, StatusHistogram> = BTreeMap::new();
        let mut owners: HashMap<String, CarrierId> = HashMap::new();
        for carrier in carriers {
            let key = carrier.display_code();
            if let Some(owner) = owners.insert(key.clone(), carrier.id) {
                warn!(
                    kind = %kind,
                    "Carriers {} and {} share display code '{}', merging their histograms",
                    owner, carrier.id, key
                );
            }

            let visit = reachable_carriers(self.hierarchy.as_ref(), carrier.id, include_deployments).await;

            let mut histogram = StatusHistogram::default();
            for id in &visit {
                if let Some(states) = states_by_carrier.get(id) {
                    for state in states {
                        histogram.record(*state);
                    }
                }
            }

            result.entry(key).or_default().merge(&histogram);
        }

        Ok(result)
    }
}
