//! # 🧺 Interface container
// (c) 2025 Ross Younger
//!
//! An [`InterfaceContainer`] runs the configured set of interfaces for one OBCP.
//! They share a [`WorkerPool`] and a [`TransactionStore`]; each has its own
//! [`SossLink`](crate::interface::link::SossLink).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::interface::archive::{Archive, FileSaver, TransferMethod, inband_channel};
use crate::interface::collaborators::{
    FrameIndex, JsonLinesFrameIndex, MemoryStatus, StatusSink, StatusSource, TracingFrameIndex,
};
use crate::interface::command::{CommandChannel, channel_name};
use crate::interface::link::{Role, SOSS_VERSION, SossHandler, SossLink, SossSender, programs_for};
use crate::interface::status_receiver::StatusReceiver;
use crate::interface::status_request::StatusRequest;
use crate::interface::through::ThroughCommand;
use crate::protocol::service::Service;
use crate::server::{RpcServer, ServerOptions};
use crate::store::{Event, TransactionStore};
use crate::transport::{ChannelOptions, LazyClient, ProgramConnector, XidCounter, XidSource};

pub mod pool;
pub use pool::{WorkerPool, default_size};

/// The kinds of interface a container can run
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum InterfaceKind {
    /// Device-dependent commands to the OBCP
    Cmd,
    /// Through commands from the OBCP
    Thru,
    /// Status requests from the OBCP
    Sreq,
    /// Status table pushes
    Sdst,
    /// Frame file transfers
    File,
}

/// Parses a comma or space separated list of interface names.
/// Duplicates are ignored; order is kept.
pub fn parse_interfaces(list: &str) -> anyhow::Result<Vec<InterfaceKind>> {
    use strum::VariantNames as _;
    let mut kinds = Vec::new();
    for name in list
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        let kind: InterfaceKind = name.parse().map_err(|_| {
            anyhow::anyhow!(
                "unknown interface {name} (expected one of {})",
                InterfaceKind::VARIANTS.join(", ")
            )
        })?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// The external services the interfaces call out to
#[derive(Clone, Debug)]
pub struct Collaborators {
    /// Answers status requests
    pub status_source: Arc<dyn StatusSource>,
    /// Receives pushed status tables
    pub status_sink: Arc<dyn StatusSink>,
    /// Records file transfers
    pub frame_index: Arc<dyn FrameIndex>,
}

impl Default for Collaborators {
    /// An in-memory status table (serving as both source and sink) and a logging frame index
    fn default() -> Self {
        Self::with_status(Arc::new(MemoryStatus::new()), Arc::new(TracingFrameIndex))
    }
}

impl Collaborators {
    fn with_status(status: Arc<MemoryStatus>, frame_index: Arc<dyn FrameIndex>) -> Self {
        Self {
            status_source: status.clone(),
            status_sink: status,
            frame_index,
        }
    }

    /// The shipped collaborators, as the configuration asks for them
    pub fn from_config(config: &Configuration) -> anyhow::Result<Self> {
        let status = match &config.status_file {
            Some(path) => MemoryStatus::from_file(path)?,
            None => MemoryStatus::new(),
        };
        let index: Arc<dyn FrameIndex> = match &config.transfer_log {
            Some(path) => Arc::new(JsonLinesFrameIndex::new(path)),
            None => Arc::new(TracingFrameIndex),
        };
        Ok(Self::with_status(Arc::new(status), index))
    }
}

/// A running set of interfaces
#[derive(Debug)]
pub struct InterfaceContainer {
    store: Arc<TransactionStore>,
    pool: WorkerPool,
    command: Option<Arc<CommandChannel>>,
    links: HashMap<InterfaceKind, SossLink>,
    fits_server: Option<RpcServer>,
}

/// Things every interface needs while it is being set up
struct Setup<'a> {
    config: &'a Configuration,
    collaborators: &'a Collaborators,
    options: ServerOptions,
    xids: Arc<dyn XidSource>,
}

impl Setup<'_> {
    /// The sender for `service` in `role`, if that end ever sends
    fn sender(&self, service: Service, role: Role) -> anyhow::Result<Option<Arc<SossSender>>> {
        let (_, send) = programs_for(service, role)?;
        Ok(send.map(|program| {
            let connector = ProgramConnector {
                program,
                version: SOSS_VERSION,
                protocol: self.config.protocol,
                port: self.config.call_port(),
                xids: self.xids.clone(),
                options: ChannelOptions {
                    retry: self.config.retry_policy(),
                    ..Default::default()
                },
            };
            Arc::new(SossSender::new(program, LazyClient::new(Box::new(connector))))
        }))
    }

    fn required_sender(&self, service: Service, role: Role) -> anyhow::Result<Arc<SossSender>> {
        self.sender(service, role)?
            .with_context(|| format!("{service} has no reply path"))
    }
}

impl InterfaceContainer {
    /// Starts every interface the configuration names
    pub async fn start(
        config: &Configuration,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let kinds = config.interface_kinds()?;
        let size = match config.num_threads {
            0 => default_size(kinds.len()),
            n => n,
        };
        let mut container = Self {
            store: Arc::new(TransactionStore::new()),
            pool: WorkerPool::new(size),
            command: None,
            links: HashMap::new(),
            fits_server: None,
        };
        let setup = Setup {
            config,
            collaborators: &collaborators,
            options: config.server_options(),
            xids: XidCounter::shared(),
        };
        for kind in kinds {
            if let Err(e) = container.start_interface(kind, &setup).await {
                container.stop().await;
                return Err(e.context(format!("starting the {kind} interface")));
            }
        }
        info!(
            "started {} interface(s) for OBCP {} ({}), {} workers",
            container.links.len(),
            config.obcp_num,
            config.obcp_host,
            size
        );
        Ok(container)
    }

    async fn start_interface(
        &mut self,
        kind: InterfaceKind,
        setup: &Setup<'_>,
    ) -> anyhow::Result<()> {
        let config = setup.config;
        let my_host = config.my_host.as_str();
        let obcp = config.obcp_num;
        let (service, role, handler): (Service, Role, Arc<dyn SossHandler>) = match kind {
            InterfaceKind::Cmd => {
                let service = Service::Command(obcp);
                let sender = setup.required_sender(service, Role::Initiator)?;
                let channel = Arc::new(CommandChannel::new(
                    obcp,
                    &config.obcp_host,
                    my_host,
                    self.store.clone(),
                    sender,
                ));
                self.command = Some(channel.clone());
                (service, Role::Initiator, channel)
            }
            InterfaceKind::Thru => {
                let sender = setup.required_sender(Service::Through, Role::Responder)?;
                (
                    Service::Through,
                    Role::Responder,
                    Arc::new(ThroughCommand::new(my_host, sender)),
                )
            }
            InterfaceKind::Sreq => {
                let sender = setup.required_sender(Service::StatusRequest, Role::Responder)?;
                (
                    Service::StatusRequest,
                    Role::Responder,
                    Arc::new(StatusRequest::new(
                        my_host,
                        config.allowed_hosts(),
                        setup.collaborators.status_source.clone(),
                        sender,
                    )),
                )
            }
            InterfaceKind::Sdst => {
                let unit = config.monitor_unit;
                (
                    Service::StatusPush(unit),
                    Role::Responder,
                    Arc::new(StatusReceiver::new(
                        unit,
                        setup.collaborators.status_sink.clone(),
                    )),
                )
            }
            InterfaceKind::File => {
                let service = Service::FileTransfer(obcp);
                let sender = setup.required_sender(service, Role::Responder)?;
                let mut saver = FileSaver::new(
                    my_host,
                    config.archive_settings(),
                    self.store.clone(),
                    setup.collaborators.frame_index.clone(),
                );
                if config.transfer_method == TransferMethod::Rpc {
                    let program = Service::FitsData(obcp).programs()?.server_receive;
                    let (fits, receiver) = inband_channel(program);
                    let options = ServerOptions {
                        port: (config.fits_port != 0).then_some(config.fits_port),
                        ..setup.options.clone()
                    };
                    let server = RpcServer::start(Arc::new(fits), &options, setup.xids.clone())
                        .await
                        .context("starting the FITS data server")?;
                    info!("FITS data server listening on {}", server.local_addr());
                    self.fits_server = Some(server);
                    saver = saver.with_inband(receiver);
                }
                (
                    service,
                    Role::Responder,
                    Arc::new(Archive::new(saver, config.allowed_hosts(), sender)),
                )
            }
        };
        let link = SossLink::start(
            service,
            role,
            handler,
            self.pool.clone(),
            &setup.options,
            setup.xids.clone(),
        )
        .await?;
        match link.local_addr() {
            Some(addr) => info!("{kind}: {service} listening on {addr}"),
            None => debug!("{kind}: {service} started"),
        }
        let _ = self.links.insert(kind, link);
        Ok(())
    }

    /// The transaction store shared by every interface
    #[must_use]
    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    /// The worker pool shared by every interface
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Where an interface is listening, if it is running and listens
    #[must_use]
    pub fn local_addr(&self, kind: InterfaceKind) -> Option<SocketAddr> {
        self.links.get(&kind).and_then(SossLink::local_addr)
    }

    /// Where the FITS data server is listening, if it is running
    #[must_use]
    pub fn fits_addr(&self) -> Option<SocketAddr> {
        self.fits_server.as_ref().map(RpcServer::local_addr)
    }

    fn command_channel(&self) -> anyhow::Result<Arc<CommandChannel>> {
        self.command
            .clone()
            .context("the cmd interface is not running")
    }

    /// Starts a command under `tag`. The message is sent by a pool worker.
    ///
    /// Progress is published on the command channel's events; the last event for the tag has `done` set.
    pub fn send_command(&self, tag: &str, command: &str) -> anyhow::Result<()> {
        let channel = self.command_channel()?;
        let command = channel.begin(tag, command)?;
        let tag = tag.to_string();
        self.pool.submit(async move {
            // failures are recorded against the tag
            let _ = channel.transmit(&tag, &command).await;
        });
        Ok(())
    }

    /// Sends a command and waits for its terminal event
    pub async fn await_completion(&self, tag: &str, command: &str) -> anyhow::Result<Event> {
        let channel = self.command_channel()?;
        let mut events = self.store.events().subscribe(&[&channel_name(channel.obcp())]);
        self.send_command(tag, command)?;
        while let Some(event) = events.recv().await {
            let done = event.fields.get("done").and_then(serde_json::Value::as_bool);
            if event.tag == tag && done == Some(true) {
                return Ok(event);
            }
        }
        anyhow::bail!("{tag}: event stream closed before the command finished")
    }

    /// Stops every interface and the worker pool
    pub async fn stop(mut self) {
        for (kind, link) in self.links.drain() {
            debug!("stopping {kind}");
            link.stop().await;
        }
        if let Some(server) = self.fits_server.take() {
            server.stop().await;
        }
        self.pool.shutdown().await;
        if !self.store.is_empty() {
            warn!("{} transaction(s) unfinished at shutdown", self.store.len());
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{Collaborators, InterfaceContainer, InterfaceKind, parse_interfaces};
    use crate::config::Configuration;
    use crate::interface::collaborators::MemoryStatus;
    use crate::interface::link::{SOSS_VERSION, SossSender};
    use crate::protocol::service::Service;
    use crate::protocol::soss::{PacketType, SossBody, SossMessage};
    use crate::transport::{ChannelOptions, LazyClient, ProgramConnector, Protocol, XidCounter};
    use crate::util::PortRange;

    #[test]
    fn interface_lists() {
        assert_eq!(
            parse_interfaces("cmd, FILE sreq,cmd").unwrap(),
            [InterfaceKind::Cmd, InterfaceKind::File, InterfaceKind::Sreq]
        );
        assert!(parse_interfaces("").unwrap().is_empty());
        let e = parse_interfaces("cmd,status").unwrap_err();
        assert!(e.to_string().contains("status"));
    }

    fn loopback_config(interfaces: &str) -> Configuration {
        Configuration {
            interfaces: interfaces.into(),
            my_host: "localhost".into(),
            obcp_host: "localhost".into(),
            portmapper: false,
            port_range: PortRange {
                begin: 41000,
                end: 48999,
            },
            num_threads: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pushed_tables_reach_the_sink() {
        let status = Arc::new(MemoryStatus::new());
        let collaborators = Collaborators {
            status_source: status.clone(),
            status_sink: status.clone(),
            frame_index: Arc::new(crate::interface::collaborators::TracingFrameIndex),
        };
        let container = InterfaceContainer::start(&loopback_config("sdst"), collaborators)
            .await
            .unwrap();
        let addr = container.local_addr(InterfaceKind::Sdst).unwrap();
        assert!(container.local_addr(InterfaceKind::Cmd).is_none());

        let program = Service::StatusPush(3).programs().unwrap().server_receive;
        let sender = SossSender::new(
            program,
            LazyClient::new(Box::new(ProgramConnector {
                program,
                version: SOSS_VERSION,
                protocol: Protocol::Tcp,
                port: Some(addr.port()),
                xids: XidCounter::shared(),
                options: ChannelOptions::default(),
            })),
        );
        let msg = SossMessage::new(
            "obcp9",
            "localhost",
            1,
            PacketType::Status,
            SossBody::StatusData {
                table: "TSCV0001".into(),
                data: "0123456789".into(),
            },
        );
        sender.send(&msg).await.unwrap();

        let mut table = None;
        for _ in 0..100 {
            table = status.table("TSCV0001");
            if table.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(table.as_deref(), Some("0123456789"));
        container.stop().await;
    }

    #[tokio::test]
    async fn commands_need_the_cmd_interface() {
        let container =
            InterfaceContainer::start(&loopback_config("thru"), Collaborators::default())
                .await
                .unwrap();
        assert!(container.local_addr(InterfaceKind::Thru).is_some());
        let e = container.send_command("t1", "EXEC TEST").unwrap_err();
        assert!(e.to_string().contains("cmd interface"));
        container.stop().await;
    }

    #[tokio::test]
    async fn unreachable_device_fails_the_command() {
        let mut config = loopback_config("cmd");
        // nothing listens here
        config.obcp_port = 9;
        let container = InterfaceContainer::start(&config, Collaborators::default())
            .await
            .unwrap();
        let event = container
            .await_completion("t1", "EXEC TEST")
            .await
            .unwrap();
        assert_eq!(event.fields["result"], -1);
        assert!(!container.store().contains("t1"));
        container.stop().await;
    }

    #[test]
    fn bad_collaborator_files() {
        let config = Configuration {
            status_file: Some("/nonexistent/status".into()),
            ..Default::default()
        };
        assert!(Collaborators::from_config(&config).is_err());
    }
}
