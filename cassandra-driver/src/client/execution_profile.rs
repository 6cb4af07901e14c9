//! Per-workload execution settings: policies, consistency and timeouts.
//!
//! Profiles let different workloads run on a single session. There are two
//! kinds of objects involved: [`ExecutionProfile`], an immutable set of
//! settings, and [`ExecutionProfileHandle`], which points at some profile and
//! can be remapped to another one during its lifetime. Handles are assigned to
//! the [`Session`](crate::Session) and to statements.
//!
//! ### Example
//! A session whose statements default to `LocalOne` and never time out:
//! ```rust,no_run
//! # use std::error::Error;
//! # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
//! use cassandra_driver::{ExecutionProfile, Session, SessionBuilder};
//! use cassandra_driver::statement::Consistency;
//!
//! let profile = ExecutionProfile::builder()
//!     .consistency(Consistency::LocalOne)
//!     .request_timeout(None)
//!     .build();
//!
//! let session: Session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .default_execution_profile_handle(profile.into_handle())
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Example
//! Remapping a handle switches every statement holding it at once:
//! ```
//! use cassandra_driver::ExecutionProfile;
//! use cassandra_driver::statement::{Consistency, Statement};
//!
//! let one = ExecutionProfile::builder().consistency(Consistency::One).build();
//! let all = ExecutionProfile::builder().consistency(Consistency::All).build();
//!
//! let mut handle = one.into_handle();
//! let mut statement = Statement::new("SELECT * FROM ks.tab");
//! statement.set_execution_profile_handle(Some(handle.clone()));
//!
//! handle.map_to_another_profile(all);
//! assert_eq!(
//!     statement.get_execution_profile_handle().unwrap().to_profile().get_consistency(),
//!     Consistency::All,
//! );
//! ```

use std::{fmt::Debug, sync::Arc, time::Duration};

use arc_swap::ArcSwap;

use crate::frame::types::{Consistency, SerialConsistency};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;

pub(crate) mod defaults {
    use super::ExecutionProfileInner;
    use crate::frame::types::{Consistency, SerialConsistency};
    use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
    use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn consistency() -> Consistency {
        Consistency::LocalQuorum
    }
    pub(crate) fn serial_consistency() -> Option<SerialConsistency> {
        Some(SerialConsistency::LocalSerial)
    }
    pub(crate) fn request_timeout() -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
    pub(crate) fn attempt_timeout() -> Option<Duration> {
        None
    }
    pub(crate) fn load_balancing_policy() -> Arc<dyn LoadBalancingPolicy> {
        Arc::new(RoundRobinPolicy::new())
    }
    pub(crate) fn retry_policy() -> Arc<dyn RetryPolicy> {
        Arc::new(DefaultRetryPolicy::new())
    }

    impl Default for ExecutionProfileInner {
        fn default() -> Self {
            Self {
                request_timeout: request_timeout(),
                attempt_timeout: attempt_timeout(),
                consistency: consistency(),
                serial_consistency: serial_consistency(),
                load_balancing_policy: load_balancing_policy(),
                retry_policy: retry_policy(),
            }
        }
    }
}

/// Builder of [`ExecutionProfile`]. Options left unset take the defaults
/// listed on each setter.
///
/// # Example
///
/// ```
/// # use cassandra_driver::ExecutionProfile;
/// # use cassandra_driver::policies::retry::FallthroughRetryPolicy;
/// # use cassandra_driver::statement::Consistency;
/// # use std::sync::Arc;
/// let profile: ExecutionProfile = ExecutionProfile::builder()
///     .consistency(Consistency::Two)
///     .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct ExecutionProfileBuilder {
    request_timeout: Option<Option<Duration>>,
    attempt_timeout: Option<Option<Duration>>,
    consistency: Option<Consistency>,
    serial_consistency: Option<Option<SerialConsistency>>,
    load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl ExecutionProfileBuilder {
    /// Changes client-side timeout. It bounds the whole execution,
    /// retries included. When it expires the execution fails with
    /// [`ExecutionError::RequestTimeout`](crate::errors::ExecutionError::RequestTimeout).
    /// The default is 30 seconds.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Bounds each attempt on a single host. An attempt that expires fails
    /// with [`RequestAttemptError::Timeout`](crate::errors::RequestAttemptError::Timeout):
    /// idempotent statements then move on to the next host of the plan,
    /// other statements fail. Should be shorter than the request timeout.
    /// The default is `None`: attempts are only bounded by the request timeout.
    ///
    /// # Example
    /// ```
    /// # use cassandra_driver::ExecutionProfile;
    /// # use std::time::Duration;
    /// let profile: ExecutionProfile = ExecutionProfile::builder()
    ///     .request_timeout(Some(Duration::from_secs(10)))
    ///     .attempt_timeout(Some(Duration::from_secs(2)))
    ///     .build();
    /// ```
    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Consistency of statements that do not set one. `LocalQuorum` by default.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Serial consistency of statements that do not set one. `LocalSerial` by default.
    pub fn serial_consistency(mut self, serial_consistency: Option<SerialConsistency>) -> Self {
        self.serial_consistency = Some(serial_consistency);
        self
    }

    /// Policy producing the host plans.
    /// The default is [`RoundRobinPolicy`](crate::policies::load_balancing::RoundRobinPolicy).
    ///
    /// # Example
    /// ```
    /// # use cassandra_driver::ExecutionProfile;
    /// # use cassandra_driver::policies::load_balancing::{RoundRobinPolicy, TokenAwarePolicy};
    /// # use std::sync::Arc;
    /// let profile: ExecutionProfile = ExecutionProfile::builder()
    ///     .load_balancing_policy(Arc::new(TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()))))
    ///     .build();
    /// ```
    pub fn load_balancing_policy(
        mut self,
        load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    ) -> Self {
        self.load_balancing_policy = Some(load_balancing_policy);
        self
    }

    /// [`RetryPolicy`] consulted on timeouts and unavailable errors.
    /// The default is [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy).
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn build(self) -> ExecutionProfile {
        ExecutionProfile(Arc::new(ExecutionProfileInner {
            request_timeout: self
                .request_timeout
                .unwrap_or_else(defaults::request_timeout),
            attempt_timeout: self
                .attempt_timeout
                .unwrap_or_else(defaults::attempt_timeout),
            consistency: self.consistency.unwrap_or_else(defaults::consistency),
            serial_consistency: self
                .serial_consistency
                .unwrap_or_else(defaults::serial_consistency),
            load_balancing_policy: self
                .load_balancing_policy
                .unwrap_or_else(defaults::load_balancing_policy),
            retry_policy: self.retry_policy.unwrap_or_else(defaults::retry_policy),
        }))
    }
}

impl Default for ExecutionProfileBuilder {
    fn default() -> Self {
        ExecutionProfile::builder()
    }
}

/// Immutable set of execution settings.
///
/// Sessions and statements refer to profiles through an
/// [`ExecutionProfileHandle`], so the profile behind them can be swapped
/// while they are in use.
#[derive(Debug, Clone)]
pub struct ExecutionProfile(pub(crate) Arc<ExecutionProfileInner>);

#[derive(Debug)]
pub(crate) struct ExecutionProfileInner {
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Option<Duration>,

    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<SerialConsistency>,

    pub(crate) load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
}

impl ExecutionProfileInner {
    pub(crate) fn to_builder(&self) -> ExecutionProfileBuilder {
        ExecutionProfileBuilder {
            request_timeout: Some(self.request_timeout),
            attempt_timeout: Some(self.attempt_timeout),
            consistency: Some(self.consistency),
            serial_consistency: Some(self.serial_consistency),
            load_balancing_policy: Some(self.load_balancing_policy.clone()),
            retry_policy: Some(self.retry_policy.clone()),
        }
    }
}

impl ExecutionProfile {
    /// Builder with every option unset.
    pub fn builder() -> ExecutionProfileBuilder {
        ExecutionProfileBuilder {
            request_timeout: None,
            attempt_timeout: None,
            consistency: None,
            serial_consistency: None,
            load_balancing_policy: None,
            retry_policy: None,
        }
    }

    /// Builder prefilled with this profile's options.
    pub fn to_builder(&self) -> ExecutionProfileBuilder {
        self.0.to_builder()
    }

    /// Wraps the profile in a fresh handle.
    pub fn into_handle(self) -> ExecutionProfileHandle {
        ExecutionProfileHandle(Arc::new((ArcSwap::new(self.0), None)))
    }

    /// Like [`into_handle`](Self::into_handle), with a label
    /// which shows up in its `Debug` output.
    pub fn into_handle_with_label(self, label: String) -> ExecutionProfileHandle {
        ExecutionProfileHandle(Arc::new((ArcSwap::new(self.0), Some(label))))
    }

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.0.request_timeout
    }

    pub fn get_attempt_timeout(&self) -> Option<Duration> {
        self.0.attempt_timeout
    }

    pub fn get_consistency(&self) -> Consistency {
        self.0.consistency
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.0.serial_consistency
    }

    pub fn get_load_balancing_policy(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.0.load_balancing_policy
    }

    pub fn get_retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.0.retry_policy
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self(Arc::new(ExecutionProfileInner::default()))
    }
}

/// Shared, remappable reference to an [`ExecutionProfile`].
///
/// Cloned handles share the pointee: remapping one of them remaps all,
/// because the profile is swapped inside a shared `ArcSwap`.
#[derive(Debug, Clone)]
pub struct ExecutionProfileHandle(Arc<(ArcSwap<ExecutionProfileInner>, Option<String>)>);

impl ExecutionProfileHandle {
    pub(crate) fn access(&self) -> Arc<ExecutionProfileInner> {
        self.0 .0.load_full()
    }

    /// Builder prefilled with the current profile's options.
    pub fn pointee_to_builder(&self) -> ExecutionProfileBuilder {
        self.0 .0.load().to_builder()
    }

    /// Current profile.
    pub fn to_profile(&self) -> ExecutionProfile {
        ExecutionProfile(self.access())
    }

    /// Points the handle, and all its clones, at `profile`. Requests
    /// started afterwards use the new settings.
    pub fn map_to_another_profile(&mut self, profile: ExecutionProfile) {
        self.0 .0.store(profile.0)
    }
}
