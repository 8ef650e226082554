//! Network size estimation seam
//!
//! Small clusters are suspicious: a peer that believes the network is
//! large but was handed a two-peer cluster for a block may be the target
//! of an eclipse. The coordinator consults an estimator before opening a
//! consensus round on an undersized cluster. The estimation algorithm
//! itself lives in the routing layer; the core consumes this interface
//! only.

pub trait NetworkSizeEstimator: Send + Sync {
    /// Current estimate, or `None` when no data has been gathered yet
    fn estimate(&self) -> Option<NetworkSizeEstimate>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSizeEstimate {
    pub size: f64,
    /// 0.0..=1.0; estimates at or below 0.5 are not trusted
    pub confidence: f64,
}

impl NetworkSizeEstimate {
    /// Within one order of magnitude of the observed cluster size
    pub fn plausibly_matches(&self, cluster_size: usize) -> bool {
        let observed = cluster_size as f64;
        self.size <= observed * 10.0 && self.size >= observed / 10.0
    }
}

/// Fixed estimate, for configuration-pinned deployments and tests
pub struct StaticSizeEstimator {
    estimate: NetworkSizeEstimate,
}

impl StaticSizeEstimator {
    pub fn new(size: f64, confidence: f64) -> Self {
        Self { estimate: NetworkSizeEstimate { size, confidence } }
    }
}

impl NetworkSizeEstimator for StaticSizeEstimator {
    fn estimate(&self) -> Option<NetworkSizeEstimate> {
        Some(self.estimate)
    }
}
