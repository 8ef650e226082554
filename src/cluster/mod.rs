//! Cluster Consensus Layer
//!
//! Everything between a transactor request and the peers responsible for
//! its blocks lives here. The layer is built around one envelope, the
//! `ClusterRecord`, carried through a two-phase promise/commit round.
//!
//! ## Components
//!
//! ### Record (`record.rs`)
//! The consensus envelope: the wrapped `RepoMessage`, the peer roster, and
//! the monotonically-growing promise and commit signature maps, identified
//! by the hash of the message's canonical encoding.
//!
//! ### Member (`member.rs`)
//! Every cluster peer's side of the protocol: executes or
//! precondition-checks the wrapped request, signs approvals and
//! rejections, and replays stored signatures for duplicate message hashes
//! so retries never double-apply.
//!
//! ### Coordinator (`coordinator.rs`)
//! The requesting peer's side: parallel promise fan-out, super-majority
//! and rejection gates, simple-majority commit, and background
//! exponential-backoff retries for stragglers.
//!
//! ### Coordinated repository (`coordinated.rs`)
//! A `Transactor` implementation that routes each request to its
//! responsible cluster, making the consensus pipeline indistinguishable
//! from a local repository to callers.
//!
//! ### Transport (`transport.rs`) and estimator (`estimator.rs`)
//! The seams to the out-of-scope collaborators: peer channels, the
//! block-to-cluster directory, and the network size estimator consulted
//! for small-cluster validation. `InProcessNetwork` is the in-process
//! reference implementation of the first two.

pub mod coordinated;
pub mod coordinator;
pub mod estimator;
pub mod member;
pub mod record;
pub mod transport;

pub use coordinated::CoordinatedRepo;
pub use coordinator::{ClusterCoordinator, ClusterError, ConsensusConfig, RetryPolicy};
pub use estimator::{NetworkSizeEstimate, NetworkSizeEstimator, StaticSizeEstimator};
pub use member::ClusterMember;
pub use record::{ClusterRecord, CommitSig, PeerInfo, Promise, PromiseKind, RepoMessage};
pub use transport::{ClusterDirectory, ClusterTransport, InProcessNetwork, TransportError};
