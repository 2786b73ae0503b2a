// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine version to diagnostic capability mapping.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Optional diagnostic feature of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Persisted history of queries, plans and runtime statistics.
    HistoricalStore,
    /// Per-category wait statistics in the historical store.
    WaitCategoryDetail,
    AutomaticPlanCorrection,
    /// Lightweight profiling of in-flight queries.
    LiveQueryStatistics,
    ParameterSensitivePlans,
}

/// Minimum engine major version per feature.
const FEATURE_TABLE: &[(Feature, u32)] = &[
    (Feature::HistoricalStore, 13),
    (Feature::WaitCategoryDetail, 14),
    (Feature::AutomaticPlanCorrection, 14),
    (Feature::LiveQueryStatistics, 15),
    (Feature::ParameterSensitivePlans, 16),
];

impl Feature {
    pub fn min_version(self) -> u32 {
        FEATURE_TABLE
            .iter()
            .find(|(feature, _)| *feature == self)
            .map(|(_, version)| *version)
            .unwrap_or(u32::MAX)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::HistoricalStore => "historical-store",
            Feature::WaitCategoryDetail => "wait-category-detail",
            Feature::AutomaticPlanCorrection => "automatic-plan-correction",
            Feature::LiveQueryStatistics => "live-query-statistics",
            Feature::ParameterSensitivePlans => "parameter-sensitive-plans",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features available on one engine version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub engine_major_version: u32,
    pub features: BTreeSet<Feature>,
}

impl CapabilityProfile {
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Resolves capability profiles from the static version table.
pub struct SourceCapabilityResolver;

impl SourceCapabilityResolver {
    pub fn resolve(engine_major_version: u32) -> CapabilityProfile {
        let features = FEATURE_TABLE
            .iter()
            .filter(|(_, min)| engine_major_version >= *min)
            .map(|(feature, _)| *feature)
            .collect();
        CapabilityProfile {
            engine_major_version,
            features,
        }
    }
}
