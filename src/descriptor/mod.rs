//! Joint descriptor builder: co-sign or timelocked client reclaim

pub mod builder;
pub mod policy;

pub use builder::{build_joint_timelocked_address, ConfidentialAddress, JointDescriptor};
pub use policy::{JointPolicy, LockingScript, PolicyScript, SpendBranch, MAX_CSV_DELAY};
