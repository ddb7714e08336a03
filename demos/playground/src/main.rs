use clap::{value_parser, Arg, Command};
use courier_delivery::{AckListener, Broadcaster, Engine};
use courier_playground::{
    api::{self, AppState},
    node::Node,
    telemetry, Config,
};
use courier_transport::{memory::Bus, resilient};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    // Parse arguments
    let matches = Command::new("playground")
        .about("compare Direct and PubSub delivery over a simulated unreliable network")
        .arg(Arg::new("config").long("config").required(false))
        .arg(
            Arg::new("listen")
                .long("listen")
                .required(false)
                .default_value("127.0.0.1:8080")
                .value_parser(value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .required(false)
                .default_value("info"),
        )
        .get_matches();

    // Create logger
    let level = matches.get_one::<String>("log-level").unwrap();
    let level = Level::from_str(level).expect("Invalid log level");
    telemetry::init(level);

    // Load config
    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            let file = std::fs::read_to_string(path).expect("Could not read config file");
            serde_yaml::from_str::<Config>(&file).expect("Could not parse config file")
        }
        None => Config::default(),
    };
    info!(nodes = config.nodes.len(), "loaded config");

    // Create the transport (degrading to a local bus if the primary fails)
    let mut registry = Registry::default();
    let transport = resilient::Resilient::new(
        Bus::new(),
        Bus::new(),
        config.transport(),
        resilient::Metrics::init(&mut registry),
    );

    // Start the engine
    let engine = Engine::new(transport, &mut registry, config.engine());
    engine.start();
    Broadcaster::new(engine.clone(), config.broadcast_interval()).start();
    if let Err(err) = AckListener::new(engine.clone(), &mut registry).start().await {
        error!(?err, "failed to start ack listener");
        return;
    }
    for node in &config.nodes {
        if let Err(err) = Node::new(node.id.as_str(), node.ack_probability, engine.clone())
            .start()
            .await
        {
            error!(?err, node = %node.id, "failed to start node");
            return;
        }
    }

    // Serve the API
    let listen = *matches.get_one::<SocketAddr>("listen").unwrap();
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("Could not bind to listen address");
    info!(%listen, "serving");
    let app = api::router(AppState {
        engine: engine.clone(),
        registry: Arc::new(registry),
    });
    let shutdown = {
        let cancel = engine.cancellation();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                _ = cancel.cancelled() => {},
            }
        }
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(?err, "server failed");
    }

    // Stop all deliveries
    engine.shutdown().await;
}
