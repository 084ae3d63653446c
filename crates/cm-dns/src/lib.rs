//! DNS-01 challenge record management across cloud DNS platforms, and the
//! propagation check that gates telling the ACME server a challenge is ready.

pub mod azure;
mod factory;
pub mod gcp;
pub mod mock;
pub mod propagation;
pub mod provider;
pub mod route53;

pub use factory::{build_provider, ProviderSettings};
pub use mock::MockDnsProvider;
pub use propagation::{
    wait_before_attempt, Backoff, DohResolver, PropagationConfig, PropagationVerifier, TxtResolver,
};
pub use provider::{DnsProvider, DnsProviderError, DnsResult};
