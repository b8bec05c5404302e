//! Boot sequence.
//!
//! 1. read the router parameters (defaults when the store is unavailable)
//! 2. resolve and apply the MAC policy
//! 3. load the port-mapping table
//! 4. bring up both interfaces and enable NAT
//! 5. wait, bounded, for the upstream to come up
//!
//! Only a network stack that refuses to create or start its interfaces
//! fails the boot; every other fault degrades.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use router_common::keys;
use router_common::{ConfigAccessor, PersistentStore, RouterConfig, RouterError, RouterResult};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::dns::DnsSelector;
use crate::mac::MacPolicy;
use crate::nat::NatEngine;
use crate::netif::NetStack;
use crate::orchestrator::{Orchestrator, UplinkState};
use crate::portmap::PortMapManager;

/// Default upstream join wait.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Boot parameters that do not come from the Persistent Store.
#[derive(Debug, Clone)]
pub struct BootOptions {
    /// Store namespace of the router parameters.
    pub namespace: String,
    /// How long boot waits for the upstream link.
    pub join_timeout: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            namespace: keys::PARAM_NAMESPACE.to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// How boot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The upstream came up within the join wait.
    Connected,
    /// The join wait expired; the upstream keeps retrying in the
    /// background.
    TimedOut,
    /// No upstream network is configured, or the station could not be
    /// brought up.
    AccessPointOnly,
}

/// A booted router.
pub struct Router {
    config: RouterConfig,
    orchestrator: Arc<Orchestrator>,
    events: JoinHandle<()>,
}

impl Router {
    /// Runs the boot sequence against the given collaborators.
    #[instrument(skip_all, fields(namespace = %options.namespace))]
    pub async fn boot(
        store: Arc<dyn PersistentStore>,
        stack: Arc<dyn NetStack>,
        nat: Arc<dyn NatEngine>,
        options: BootOptions,
    ) -> RouterResult<(Self, BootOutcome)> {
        let accessor = ConfigAccessor::new(store.clone(), options.namespace.clone());
        let config = RouterConfig::load_or_default(&accessor);

        let portmap = Arc::new(PortMapManager::new(
            store,
            options.namespace.clone(),
            nat.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            stack.clone(),
            nat,
            portmap.clone(),
            DnsSelector::new(config.dns_override),
        ));

        let policy = match MacPolicy::from_config(&accessor) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "MAC policy unavailable, keeping factory address");
                MacPolicy::Factory
            }
        };
        if let Err(e) = apply_mac_policy(&orchestrator, stack.as_ref(), policy).await {
            error!(policy = %policy, error = %e, "Failed to apply MAC policy");
        }

        match portmap.load().await {
            Ok(count) => info!(mappings = count, "Port-mapping table ready"),
            Err(e) => warn!(error = %e, "Starting with an empty port-mapping table"),
        }

        let events = orchestrator.bring_up(&config).await?;

        let outcome = if !orchestrator.upstream_active() {
            BootOutcome::AccessPointOnly
        } else if orchestrator.wait_connected(options.join_timeout).await {
            BootOutcome::Connected
        } else {
            let timeout = RouterError::ConnectTimeout {
                timeout_ms: u64::try_from(options.join_timeout.as_millis()).unwrap_or(u64::MAX),
            };
            warn!(error = %timeout, "Continuing as access point, upstream retries in background");
            BootOutcome::TimedOut
        };

        portmap.log_table().await;
        info!(outcome = ?outcome, state = %orchestrator.state(), "Boot complete");

        Ok((
            Self {
                config,
                orchestrator,
                events,
            },
            outcome,
        ))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The port-mapping manager, for management calls.
    pub fn portmap(&self) -> &Arc<PortMapManager> {
        self.orchestrator.portmap()
    }

    pub fn state(&self) -> UplinkState {
        self.orchestrator.state()
    }

    /// Stops handling network events.
    pub fn shutdown(self) {
        self.events.abort();
        info!("Router stopped");
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

async fn apply_mac_policy(
    orchestrator: &Orchestrator,
    stack: &dyn NetStack,
    policy: MacPolicy,
) -> RouterResult<()> {
    if policy == MacPolicy::Factory {
        return Ok(());
    }
    let factory = stack.factory_mac().await?;
    let resolved = policy.resolve(factory, &mut rand::thread_rng());
    if let Some(mac) = resolved {
        orchestrator.apply_base_mac(mac).await?;
    }
    Ok(())
}
