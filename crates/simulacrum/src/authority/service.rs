//! The model authority service
//!
//! Owns the engine, the TWISS/RMAT table channels, the command server and the
//! broadcast publisher. Commands only mark the model dirty; the
//! `push-refresh` and `broadcast` timers do the recomputing.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;

use simulacrum_runtime::{
    AccessMode, BroadcastPublisher, ChannelValue, CommandEnvelope, CommandServer, PvRequest, RefreshScheduler,
    RefreshTarget, RoutingTable, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec, ValueType,
};
use simulacrum_types::{tags, CommandReply, CommandRequest, Snapshot};

use super::engine::{EngineError, ModelEngine};
use super::tables::{
    orbit_array, parse_column, parse_marker_twiss, profile_array, LatticeRow, RmatRow, TableDocument, TwissRow,
};
use super::AuthorityError;
use crate::config::SimulacrumConfig;

pub const PUSH_TIMER: &str = "push-refresh";
pub const BROADCAST_TIMER: &str = "broadcast";

/// Markers that may denote the start of the undulator, in order of preference
pub const MARKER_CANDIDATES: [&str; 3] = ["UNDSTART", "BEGUNDH", "BEGUNDS"];

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    /// Model name used in table channel names
    pub name: String,
    pub command_addr: String,
    pub broadcast_addr: String,
    pub push_period: Duration,
    pub broadcast_period: Duration,
    /// Launch jitter sigma in metres, when enabled
    pub jitter: Option<f64>,
    pub marker_candidates: Vec<String>,
}

impl AuthoritySettings {
    pub fn from_config(config: &SimulacrumConfig) -> Self {
        Self {
            name: config.model.name.clone(),
            command_addr: config.model.command_addr.clone(),
            broadcast_addr: config.model.broadcast_addr.clone(),
            push_period: config.scheduler.push_period(),
            broadcast_period: config.scheduler.broadcast_period(),
            jitter: config.jitter.enabled.then_some(config.jitter.sigma),
            marker_candidates: MARKER_CANDIDATES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Addresses the authority actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorityEndpoints {
    pub command: SocketAddr,
    pub broadcast: SocketAddr,
}

/// Names of the table channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub live_twiss: String,
    pub design_twiss: String,
    pub live_rmat: String,
    pub design_rmat: String,
}

impl TableNames {
    pub fn new(model: &str) -> Self {
        let name = |suffix: &str| format!("SIMULACRUM:SYS0:1:{}:{}", model, suffix);
        Self {
            live_twiss: name("LIVE:TWISS"),
            design_twiss: name("DESIGN:TWISS"),
            live_rmat: name("LIVE:RMAT"),
            design_rmat: name("DESIGN:RMAT"),
        }
    }

    fn all(&self) -> [&str; 4] {
        [&self.live_twiss, &self.design_twiss, &self.live_rmat, &self.design_rmat]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the authority's mailbox accepts
#[derive(Debug)]
pub enum AuthorityMessage {
    /// A client operation on the table channels
    Pv(PvRequest),
    /// A request from the command server
    Command(CommandEnvelope),
}

impl From<PvRequest> for AuthorityMessage {
    fn from(request: PvRequest) -> Self {
        AuthorityMessage::Pv(request)
    }
}

impl From<CommandEnvelope> for AuthorityMessage {
    fn from(envelope: CommandEnvelope) -> Self {
        AuthorityMessage::Command(envelope)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model State
// ─────────────────────────────────────────────────────────────────────────────

/// The part of the authority the refresh scheduler recomputes from
struct ModelState<E> {
    engine: E,
    table: RoutingTable,
    names: TableNames,
    marker_candidates: Vec<String>,
}

impl<E: ModelEngine> ModelState<E> {
    fn post_table<T: Serialize>(&mut self, name: &str, rows: Vec<T>) -> Result<(), AuthorityError> {
        let json = TableDocument::now(rows).to_json()?;
        self.table.post(name, ChannelValue::String(json))?;
        Ok(())
    }

    fn publish_tables(&mut self, design: bool) -> Result<(), AuthorityError> {
        let (suffix, twiss_name, rmat_name) = if design {
            (" design", self.names.design_twiss.clone(), self.names.design_rmat.clone())
        } else {
            ("", self.names.live_twiss.clone(), self.names.live_rmat.clone())
        };

        let lattice = self.engine.execute(&format!("show lattice{}", suffix))?;
        let twiss: Vec<TwissRow> = LatticeRow::parse_all(&lattice)?.iter().map(TwissRow::from).collect();
        self.post_table(&twiss_name, twiss)?;

        let rmat = RmatRow::parse_all(&self.engine.execute(&format!("show rmat{}", suffix))?)?;
        self.post_table(&rmat_name, rmat)
    }

    fn column(&mut self, datum: &str) -> Result<Vec<f64>, AuthorityError> {
        parse_column(&self.engine.execute(&format!("show data {}", datum))?)
    }

    fn orbit_snapshot(&mut self) -> Result<Snapshot, AuthorityError> {
        let x = self.column("orbit.x")?;
        let y = self.column("orbit.y")?;
        let energy = self.column("orbit.e")?;
        Ok(Snapshot::array(tags::ORBIT, &orbit_array(&x, &y, &energy)?))
    }

    fn profile_snapshot(&mut self) -> Result<Snapshot, AuthorityError> {
        let rows = LatticeRow::parse_all(&self.engine.execute("show lattice")?)?;
        Ok(Snapshot::array(tags::PROFILE_DATA, &profile_array(&rows)?))
    }

    fn marker_snapshot(&mut self) -> Result<Snapshot, AuthorityError> {
        for candidate in &self.marker_candidates {
            match self.engine.execute(&format!("show twiss {}", candidate)) {
                Ok(lines) => {
                    let twiss = parse_marker_twiss(candidate, &lines)?;
                    return Ok(Snapshot::structured(tags::TWISS_AT_MARKER, &twiss)?);
                }
                Err(EngineError::UnknownElement(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthorityError::NoMarker(self.marker_candidates.clone()))
    }
}

impl<E: ModelEngine> RefreshTarget for ModelState<E> {
    type Error = AuthorityError;

    fn refresh_push(&mut self) -> Result<(), AuthorityError> {
        self.publish_tables(false)
    }

    fn snapshot_kinds(&self) -> Vec<String> {
        vec![
            tags::ORBIT.to_string(),
            tags::PROFILE_DATA.to_string(),
            tags::TWISS_AT_MARKER.to_string(),
        ]
    }

    fn compute_snapshot(&mut self, kind: &str) -> Result<Snapshot, AuthorityError> {
        match kind {
            tags::ORBIT => self.orbit_snapshot(),
            tags::PROFILE_DATA => self.profile_snapshot(),
            tags::TWISS_AT_MARKER => self.marker_snapshot(),
            other => Err(AuthorityError::UnknownSnapshot(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// The model authority
pub struct ModelService<E: ModelEngine> {
    state: ModelState<E>,
    scheduler: RefreshScheduler,
    settings: AuthoritySettings,
    command_server: Option<CommandServer>,
    publisher: Option<BroadcastPublisher>,
    ready: Option<oneshot::Sender<AuthorityEndpoints>>,
    rng: StdRng,
}

impl<E: ModelEngine> ModelService<E> {
    pub fn new(engine: E, settings: AuthoritySettings) -> Self {
        Self {
            state: ModelState {
                engine,
                table: RoutingTable::new(),
                names: TableNames::new(&settings.name),
                marker_candidates: settings.marker_candidates.clone(),
            },
            scheduler: RefreshScheduler::new(),
            settings,
            command_server: None,
            publisher: None,
            ready: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Get notified with the bound addresses once the service has started
    pub fn ready_signal(&mut self) -> oneshot::Receiver<AuthorityEndpoints> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    fn handle_command(&mut self, request: CommandRequest) -> CommandReply {
        match request {
            CommandRequest::Evaluate(instruction) => match self.evaluate(&instruction) {
                Ok(lines) => CommandReply::ok(Some(json!(lines))),
                Err(e) => {
                    tracing::debug!(instruction = %instruction, error = %e, "Instruction failed");
                    CommandReply::fail(e.to_string())
                }
            },
            CommandRequest::EvaluateBatch(instructions) => self.evaluate_batch(&instructions),
            CommandRequest::MarkDirty(kind) => {
                tracing::trace!(kind = ?kind, "Marked dirty");
                self.scheduler.mark_dirty();
                CommandReply::ok(None)
            }
            CommandRequest::Echo(value) => CommandReply::ok(Some(value)),
        }
    }

    fn run_instruction(&mut self, instruction: &str) -> Result<Vec<String>, AuthorityError> {
        if instruction.split_whitespace().next() == Some("exit") {
            return Err(AuthorityError::Refused(instruction.trim().to_string()));
        }
        Ok(self.state.engine.execute(instruction)?)
    }

    fn evaluate(&mut self, instruction: &str) -> Result<Vec<String>, AuthorityError> {
        let lines = self.run_instruction(instruction)?;
        if self.state.engine.is_mutating(instruction) {
            self.scheduler.mark_dirty();
        }
        Ok(lines)
    }

    /// Run every instruction or none of them
    fn evaluate_batch(&mut self, instructions: &[String]) -> CommandReply {
        let checkpoint = self.state.engine.checkpoint();
        let mut results = Vec::with_capacity(instructions.len());
        let mut mutated = false;

        for (index, instruction) in instructions.iter().enumerate() {
            match self.run_instruction(instruction) {
                Ok(lines) => {
                    mutated |= self.state.engine.is_mutating(instruction);
                    results.push(lines);
                }
                Err(e) => {
                    self.state.engine.restore(checkpoint);
                    tracing::debug!(index, instruction = %instruction, error = %e, "Batch rolled back");
                    return CommandReply::fail(format!("instruction {} ({}) failed: {}", index + 1, instruction, e));
                }
            }
        }

        if mutated {
            self.scheduler.mark_dirty();
        }
        CommandReply::ok(Some(json!(results)))
    }

    fn apply_jitter(&mut self, sigma: f64) {
        for coordinate in ["x", "y"] {
            let offset = gaussian(&mut self.rng, sigma);
            let instruction = format!("set particle_start {} = {}", coordinate, offset);
            if let Err(e) = self.evaluate(&instruction) {
                tracing::warn!(error = %e, "Jitter failed");
            }
        }
    }

    fn broadcast(&mut self) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let report = self
            .scheduler
            .broadcast_tick(&mut self.state, |snapshot| publisher.publish(snapshot).map(|_| ()));
        if !report.is_empty() {
            tracing::trace!(
                published = report.published.len(),
                failed = report.failed.len(),
                subscribers = publisher.subscriber_count(),
                "Broadcast cycle"
            );
        }
    }
}

/// Box-Muller sample from N(0, sigma)
fn gaussian(rng: &mut impl Rng, sigma: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn init_error(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::InitializationFailed(e.to_string())
}

#[async_trait]
impl<E: ModelEngine> Service for ModelService<E> {
    type Message = AuthorityMessage;

    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("model-authority", "Model Authority")
            .with_timer(PUSH_TIMER, self.settings.push_period)
            .with_timer(BROADCAST_TIMER, self.settings.broadcast_period)
            .singleton(true)
            .with_description("Owns the physics model and publishes its snapshots")
    }

    async fn on_start(&mut self, ctx: &ServiceContext<AuthorityMessage>) -> ServiceResult<()> {
        let names = self.state.names.clone();
        for name in names.all() {
            self.state
                .table
                .register_static(name, ValueType::String, ChannelValue::String(String::new()), AccessMode::ReadOnly)
                .map_err(init_error)?;
        }
        self.state.publish_tables(true).map_err(init_error)?;
        self.state.publish_tables(false).map_err(init_error)?;

        let command_server = CommandServer::bind(self.settings.command_addr.as_str(), ctx.mailbox())
            .await
            .map_err(init_error)?;
        let publisher = BroadcastPublisher::bind(self.settings.broadcast_addr.as_str())
            .await
            .map_err(init_error)?;

        let endpoints = AuthorityEndpoints {
            command: command_server.local_addr(),
            broadcast: publisher.local_addr(),
        };
        self.command_server = Some(command_server);
        self.publisher = Some(publisher);

        // Subscribers that are already waiting get a first snapshot
        self.scheduler.request_broadcast();

        tracing::info!(
            service_id = %ctx.service_id,
            command = %endpoints.command,
            broadcast = %endpoints.broadcast,
            jitter = ?self.settings.jitter,
            "Model authority started"
        );
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(endpoints);
        }
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &ServiceContext<AuthorityMessage>) -> ServiceResult<()> {
        if let Some(server) = self.command_server.take() {
            server.shutdown();
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.shutdown();
        }
        tracing::info!(
            service_id = %ctx.service_id,
            push_cycles = self.scheduler.push_cycles(),
            broadcast_cycles = self.scheduler.broadcast_cycles(),
            "Model authority stopped"
        );
        Ok(())
    }

    async fn on_message(&mut self, _ctx: &ServiceContext<AuthorityMessage>, message: AuthorityMessage) -> ServiceResult<()> {
        match message {
            AuthorityMessage::Pv(request) => self.state.table.serve(request).await,
            AuthorityMessage::Command(envelope) => {
                let reply = self.handle_command(envelope.request.clone());
                envelope.respond(reply);
            }
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext<AuthorityMessage>, timer: &str) -> ServiceResult<()> {
        match timer {
            PUSH_TIMER => {
                self.scheduler.push_tick(&mut self.state);
            }
            BROADCAST_TIMER => {
                if let Some(sigma) = self.settings.jitter {
                    self.apply_jitter(sigma);
                }
                self.broadcast();
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{Lattice, LatticeEngine};
    use simulacrum_runtime::{CommandClient, PvClient, ServiceManager, SnapshotSubscriber};
    use simulacrum_types::MarkerTwiss;

    fn settings() -> AuthoritySettings {
        AuthoritySettings {
            name: "TEST".to_string(),
            command_addr: "127.0.0.1:0".to_string(),
            broadcast_addr: "127.0.0.1:0".to_string(),
            push_period: Duration::from_millis(20),
            broadcast_period: Duration::from_millis(20),
            jitter: None,
            marker_candidates: MARKER_CANDIDATES.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn service() -> ModelService<LatticeEngine> {
        ModelService::new(LatticeEngine::new(Lattice::demo().unwrap()), settings())
    }

    #[test]
    fn test_exit_is_refused() {
        let mut service = service();
        let reply = service.handle_command(CommandRequest::evaluate("exit"));
        assert!(!reply.is_ok());
        assert!(reply.err.unwrap().contains("Refused"));
        assert_eq!(service.scheduler.flags().marks(), 0);
    }

    #[test]
    fn test_set_marks_dirty_and_show_does_not() {
        let mut service = service();
        assert!(service.handle_command(CommandRequest::evaluate("show ele Q*")).is_ok());
        assert_eq!(service.scheduler.flags().marks(), 0);

        assert!(service.handle_command(CommandRequest::evaluate("set ele QF1 k1 = 1.0")).is_ok());
        assert!(service.scheduler.flags().needs_push());
        assert!(service.scheduler.flags().needs_broadcast());
    }

    #[test]
    fn test_failed_batch_leaves_model_untouched() {
        let mut service = service();
        let before = service.state.engine.execute("show lattice").unwrap();

        let reply = service.handle_command(CommandRequest::evaluate_batch([
            "set ele QF1 k1 = 2.0",
            "set ele NOPE k1 = 1.0",
            "set ele QD1 k1 = -2.0",
        ]));
        assert!(!reply.is_ok());
        assert!(reply.err.unwrap().starts_with("instruction 2"));
        assert_eq!(service.state.engine.execute("show lattice").unwrap(), before);
        assert_eq!(service.scheduler.flags().marks(), 0);
    }

    #[test]
    fn test_snapshots_compute() {
        let mut service = service();
        let orbit = service.state.compute_snapshot(tags::ORBIT).unwrap();
        assert_eq!(orbit.metadata.shape, Some(vec![3, 4]));

        let profiles = service.state.compute_snapshot(tags::PROFILE_DATA).unwrap();
        assert_eq!(profiles.metadata.shape, Some(vec![5, 2]));

        let marker = service.state.compute_snapshot(tags::TWISS_AT_MARKER).unwrap();
        let twiss: MarkerTwiss = marker.decode_structured().unwrap();
        assert_eq!(twiss.element, "UNDSTART");

        assert!(service.state.compute_snapshot("klystrons").is_err());
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        let mut service = service();
        service.state.marker_candidates = vec!["BEGUNDH".to_string()];
        assert!(matches!(
            service.state.compute_snapshot(tags::TWISS_AT_MARKER),
            Err(AuthorityError::NoMarker(_))
        ));
    }

    #[test]
    fn test_gaussian_spread() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<f64> = (0..2000).map(|_| gaussian(&mut rng, 1e-3)).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 1e-4);
        assert!((var.sqrt() - 1e-3).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_serves_commands_tables_and_broadcasts() {
        let manager = ServiceManager::new();
        let mut authority = service();
        let ready = authority.ready_signal();
        let handle = manager.spawn(authority).await.unwrap();
        let endpoints = tokio::time::timeout(Duration::from_secs(2), ready).await.unwrap().unwrap();

        // Table channels are read-only JSON documents
        let pv = PvClient::from_mailbox(handle.mailbox());
        let names = TableNames::new("TEST");
        let design = pv.read(names.design_twiss.clone()).await.unwrap();
        let doc: TableDocument<TwissRow> = serde_json::from_str(design.as_str().unwrap()).unwrap();
        assert_eq!(doc.rows[5].element, "QF1");
        assert!(pv.write(names.live_rmat.clone(), "x".into()).await.is_err());

        let mut client = CommandClient::connect(endpoints.command).await.unwrap();
        assert_eq!(client.echo(json!("ping")).await.unwrap(), json!("ping"));

        let mut subscriber = SnapshotSubscriber::connect(endpoints.broadcast).await.unwrap();
        client.evaluate("set ele XC1 hkick = 0.001").await.unwrap();
        client.evaluate("set ele QF1 k1 = 2.0").await.unwrap();

        // Orbits published before the kick are skipped
        let kicked = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let orbit = subscriber
                    .recv_filtered(|tag| tag == tags::ORBIT)
                    .await
                    .unwrap()
                    .unwrap();
                let array = orbit.decode_array().unwrap();
                let x = array.row(0).unwrap()[0];
                if x.abs() > 0.0 {
                    break x;
                }
            }
        })
        .await
        .unwrap();
        assert!(kicked > 0.0);

        // The live table follows on the next push tick
        let design_beta = doc.rows[10].beta_x;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let live = pv.read(names.live_twiss.clone()).await.unwrap();
                let live: TableDocument<TwissRow> = serde_json::from_str(live.as_str().unwrap()).unwrap();
                if (live.rows[10].beta_x - design_beta).abs() > 1e-9 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        manager.shutdown_all().await.unwrap();
    }
}
