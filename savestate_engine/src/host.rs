use crate::config::EngineConfig;
use crate::discovery::{Advertisement, LocalService};
use crate::main_loop::{Collaborators, EngineError, EventReceiver, MainLoop};
use crate::net::{advertise_ip, OscListener, OscSender};
use crate::tree::HttpTreeFetcher;
use crossbeam_channel::{bounded, unbounded};
use std::net::SocketAddr;
use tracing::{debug, info};

const INBOUND_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

/// Owns the sockets and background threads behind a [`MainLoop`].
pub struct EngineHost {
    listener: OscListener,
    local: LocalService,
}

impl EngineHost {
    pub fn start(
        config: &EngineConfig,
    ) -> Result<(EngineHost, MainLoop, EventReceiver), EngineError> {
        let (inbound_tx, inbound_rx) = bounded(INBOUND_CAPACITY);
        let listener = OscListener::spawn(SocketAddr::new(config.bind_ip, 0), move |msg| {
            if inbound_tx.try_send(msg).is_err() {
                debug!("inbound queue full, dropping osc message");
            }
        })?;
        let osc_port = listener.local_addr().port();

        let advertised = advertise_ip(config.advertise_ip, config.bind_ip);
        let (discovery_tx, discovery_rx) = unbounded();
        let local = LocalService::advertise(
            &Advertisement {
                service_name: config.service_name.clone(),
                bind_ip: config.bind_ip,
                advertise_ip: advertised,
                osc_port,
                query_port: 0,
            },
            discovery_tx,
        )?;

        let sink = OscSender::connect(config.osc_send_addr)?;
        let fetcher = HttpTreeFetcher::new(config.fetch_timeout, config.fetch_strategy)?;
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);

        let mut main_loop = MainLoop::new(
            config,
            discovery_rx,
            inbound_rx,
            events_tx,
            Collaborators {
                directory: Box::new(local.handle()),
                fetcher: Box::new(fetcher),
                sink: Box::new(sink),
            },
        );
        main_loop.begin_discovery();
        info!(
            advertised = %advertised,
            osc_port,
            query = %local.query_addr(),
            send_to = %config.osc_send_addr,
            "engine started"
        );
        Ok((EngineHost { listener, local }, main_loop, events_rx))
    }

    pub fn osc_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn query_addr(&self) -> SocketAddr {
        self.local.query_addr()
    }

    pub fn shutdown(&self) {
        self.local.shutdown();
        self.listener.shutdown();
        info!("engine stopped");
    }
}
