//! Terminal composition root.
//!
//! Opens the stores, wires every service with the shared clock and
//! transport, and starts the background loops under one cancellation token.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::SyncTransport;
use crate::bridge::{self, BridgeActor, BridgeClient};
use crate::clock::Clock;
use crate::config::TerminalConfig;
use crate::db::{self, DbState, Schema};
use crate::diagnostics::{self, HealthReport};
use crate::error::PosError;
use crate::menu;
use crate::network::NetworkMonitor;
use crate::outbox::ChangeLog;
use crate::print::{PrintQueue, PrintRenderer};
use crate::projector::StateProjector;
use crate::reconciler::SyncReconciler;
use crate::scheduler::{JobScheduler, SchedulerTiming};
use crate::service::PosService;

pub struct TerminalRuntime {
    config: TerminalConfig,
    db: Arc<DbState>,
    projector: Arc<StateProjector>,
    reconciler: Arc<SyncReconciler>,
    scheduler: Arc<JobScheduler>,
    service: PosService,
    bridge: BridgeClient,
    network: NetworkMonitor,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TerminalRuntime {
    /// Open the on-disk stores named by `config` and start everything.
    pub async fn start(
        config: TerminalConfig,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        renderer: Arc<dyn PrintRenderer>,
    ) -> Result<Self, PosError> {
        let terminal_db = Arc::new(db::init(&config.db_path(), Schema::Terminal)?);
        let bridge_db = Arc::new(db::init(&config.bridge_db_path(), Schema::Bridge)?);
        Self::start_with_stores(config, terminal_db, bridge_db, transport, clock, renderer).await
    }

    pub async fn start_with_stores(
        config: TerminalConfig,
        terminal_db: Arc<DbState>,
        bridge_db: Arc<DbState>,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        renderer: Arc<dyn PrintRenderer>,
    ) -> Result<Self, PosError> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let projector = Arc::new(StateProjector::new(terminal_db.clone())?);
        let outbox = ChangeLog::outbox(terminal_db.clone());
        let network = NetworkMonitor::new(transport.probe().await);

        menu::init_products(&projector, transport.as_ref()).await?;

        let reconciler = Arc::new(SyncReconciler::new(
            projector.clone(),
            outbox.clone(),
            transport.clone(),
            network.clone(),
            config.role,
            clock.clone(),
        ));
        tasks.push(reconciler.clone().start(config.sync_interval, cancel.clone()));
        tasks.push(network.spawn_probe(transport.clone(), config.probe_interval, cancel.clone()));

        let (actor, bridge) = BridgeActor::new(
            ChangeLog::bridge(bridge_db),
            transport,
            &network,
            config.role,
            config.sync_interval,
        );
        tasks.push(actor.spawn(cancel.clone()));
        tasks.push(bridge::spawn_page_listener(&bridge, projector.clone(), cancel.clone()));

        let scheduler = JobScheduler::new(
            PrintQueue::new(terminal_db.clone()),
            renderer,
            config.role,
            clock.clone(),
            SchedulerTiming {
                tick_every: config.print_interval,
                print_latency: config.print_latency,
                done_grace: config.done_grace,
            },
            cancel.child_token(),
        )?;
        scheduler.start()?;

        let service = PosService::new(projector.clone(), outbox, scheduler.clone(), clock)
            .with_bridge(bridge.clone());

        info!(
            role = %config.role,
            api = %config.api_base_url,
            online = network.is_online(),
            "Terminal runtime started"
        );

        Ok(Self {
            config,
            db: terminal_db,
            projector,
            reconciler,
            scheduler,
            service,
            bridge,
            network,
            cancel,
            tasks,
        })
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn service(&self) -> &PosService {
        &self.service
    }

    pub fn projector(&self) -> &Arc<StateProjector> {
        &self.projector
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn bridge(&self) -> &BridgeClient {
        &self.bridge
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn health(&self) -> Result<HealthReport, PosError> {
        diagnostics::health_report(
            &self.db,
            self.config.role.as_str(),
            self.reconciler.summary()?,
            &self.scheduler.jobs()?,
        )
    }

    /// Stop every loop and wait for them to finish.
    pub async fn shutdown(self) {
        info!("Shutting down terminal runtime");
        self.cancel.cancel();
        self.scheduler.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Role;
    use crate::models::{OrderStatus, PrintDestination, PrintJob, Product};
    use crate::server::MemoryServer;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullRenderer;

    #[async_trait]
    impl PrintRenderer for NullRenderer {
        async fn render(&self, _job: &PrintJob) -> Result<(), PosError> {
            Ok(())
        }
    }

    fn config(role: Role) -> TerminalConfig {
        TerminalConfig {
            role,
            ..TerminalConfig::default()
        }
    }

    async fn terminal(
        role: Role,
        server: Arc<MemoryServer>,
        clock: Arc<ManualClock>,
    ) -> TerminalRuntime {
        TerminalRuntime::start_with_stores(
            config(role),
            Arc::new(db::open_in_memory(Schema::Terminal).unwrap()),
            Arc::new(db::open_in_memory(Schema::Bridge).unwrap()),
            server,
            clock,
            Arc::new(NullRenderer),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_terminals_converge_through_server() {
        let clock = Arc::new(ManualClock::new(1_000));
        let server = Arc::new(
            MemoryServer::new(clock.clone()).with_products(vec![Product {
                id: "p1".into(),
                name: "Burger".into(),
                price: 5.99,
            }]),
        );
        let cashier = terminal(Role::Cashier, server.clone(), clock.clone()).await;
        let kitchen = terminal(Role::Kitchen, server.clone(), clock.clone()).await;
        assert_eq!(cashier.projector().products().unwrap().len(), 1);

        cashier.service().add_to_cart("p1").unwrap();
        let order = cashier.service().checkout("no onions").unwrap();

        clock.advance(20_000);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let seen = kitchen.projector().order(&order.id).unwrap();
        assert_eq!(seen.map(|o| o.comments), Some(Some("no onions".to_string())));

        kitchen.service().advance_order(&order.id).unwrap();
        clock.advance(20_000);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let status = cashier.projector().order(&order.id).unwrap().unwrap().status;
        assert_eq!(status, OrderStatus::Preparing);

        let health = cashier.health().unwrap();
        assert_eq!(health.sync.pending_changes, 0);
        assert_eq!(health.role, "cashier");

        cashier.shutdown().await;
        kitchen.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_kitchen_terminal_prints_kitchen_tickets() {
        let clock = Arc::new(ManualClock::new(1));
        let server = Arc::new(MemoryServer::new(clock.clone()));
        let kitchen = terminal(Role::Kitchen, server, clock).await;

        kitchen.service().add_to_cart("p1").unwrap();
        let order = kitchen.service().checkout("").unwrap();
        let job = kitchen
            .service()
            .print_order(&order.id, PrintDestination::Kitchen, 0)
            .unwrap();
        assert!(kitchen.scheduler().is_timer_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let jobs = kitchen.scheduler().jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].status, crate::models::PrintJobStatus::Done);

        kitchen.shutdown().await;
    }
}
