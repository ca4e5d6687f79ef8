use actix_web::{
    get, middleware,
    web::Data,
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use cost_manager::{config, manager, telemetry, State};
use prometheus::{Encoder, TextEncoder};

/// Kubernetes controllers that reduce cloud compute costs
#[derive(Parser, Debug)]
#[command(name = "cost-manager", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: String,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    let state = State::default();
    let controllers = manager::run(state.clone(), config);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5);

    // Both shut down on SIGINT/SIGTERM; in-flight migration work stops at the next
    // suspension point
    let (controllers, server) = tokio::join!(controllers, server.run());
    controllers?;
    server?;
    Ok(())
}
