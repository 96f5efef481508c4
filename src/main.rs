use std::{process, sync::Arc};

use rendercache::{
    application::{error::AppError, routes, site},
    cache::{EngineConfig, RenderEngine},
    config,
    infra::{error::InfraError, http, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    let engine = Arc::new(RenderEngine::new(EngineConfig::from(&settings.render)));
    site::register(&engine)?;

    match command {
        config::Command::Serve(_) => run_serve(settings, engine).await,
        config::Command::Routes(args) => run_routes(&engine, args.json),
    }
}

async fn run_serve(settings: config::Settings, engine: Arc<RenderEngine>) -> Result<(), AppError> {
    telemetry::init(&settings.logging)?;

    let router = http::build_router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "rendercache::serve",
        addr = %settings.server.addr,
        caching_enabled = engine.config().is_enabled(),
        routes = engine.routes().len(),
        "Listening"
    );

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::from(InfraError::server(err.to_string())));

    let report = engine.shutdown(settings.server.graceful_shutdown).await;
    info!(
        target = "rendercache::serve",
        completed = report.completed,
        aborted = report.aborted,
        "Background revalidations drained"
    );

    served
}

fn run_routes(engine: &RenderEngine, json: bool) -> Result<(), AppError> {
    let summaries = routes::summarize(engine.routes());
    let output = if json {
        routes::render_json(&summaries)
            .map_err(|err| AppError::unexpected(format!("failed to encode routes: {err}")))?
    } else {
        routes::render_table(&summaries)
    };
    println!("{}", output.trim_end());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "rendercache::serve", "Shutdown signal received");
}
