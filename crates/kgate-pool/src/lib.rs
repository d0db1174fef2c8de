pub mod credential;
pub mod policy;
pub mod pool;

pub use credential::{Credential, CredentialId, CredentialStatus, ErrorKind};
pub use policy::SelectionPolicy;
pub use pool::{AcquireRequest, CredentialLease, CredentialPool, PoolConfig};
