use clap::Parser;
use dsml_gateway::error::GatewayError;
use dsml_gateway::model::recover_request_id;
use dsml_gateway::{BatchDispatcher, BatchRequest, BatchResponse, Credentials, GatewayConfig, OperationResponse};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use anyhow::{Context, Result};

#[derive(Parser)]
#[command(name = "dsml-gateway")]
#[command(about = "DSMLv2 to LDAPv3 gateway - runs batches of directory operations against an LDAP server")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Batch request documents (YAML or JSON), each run on its own connection
    #[arg(short, long, value_name = "FILE", num_args = 1.., required = true)]
    batch: Vec<PathBuf>,

    /// User to bind as (DN, or SASL authentication id when auth.authzid_type_is_id is set)
    #[arg(short, long, value_name = "USER")]
    user: Option<String>,

    /// Password for --user (falls back to DSML_GATEWAY_PASSWORD)
    #[arg(short, long, value_name = "PASSWORD", requires = "user")]
    password: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Parse a batch document, or answer it with a malformedRequest that still carries its requestID.
fn parse_batch(raw: &str) -> std::result::Result<BatchRequest, BatchResponse> {
    serde_yaml::from_str::<BatchRequest>(raw).map_err(|e| {
        let request_id = recover_request_id(raw);
        let err = GatewayError::MalformedRequest(e.to_string());
        BatchResponse {
            responses: vec![OperationResponse::error(&err, request_id.clone())],
            request_id,
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(format!("dsml_gateway={},info", log_level))
        .init();

    info!("Starting DSML gateway");

    let config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            GatewayConfig::from_file(path)?
        }
        None => {
            warn!("No --config given, using defaults");
            GatewayConfig::default()
        }
    };
    info!("Configuration loaded:");
    info!("  Directory server: {} ({:?})", config.ldap.address(), config.ldap.security);
    info!("  Default identity: {}", config.auth.default_bind_dn.as_deref().unwrap_or("anonymous"));
    info!("  SASL PLAIN for callers: {}", config.auth.authzid_type_is_id);

    let credentials = args.user.map(|user| Credentials {
        user,
        password: args.password.or_else(|| std::env::var("DSML_GATEWAY_PASSWORD").ok()),
    });
    let dispatcher = Arc::new(BatchDispatcher::with_file_resolver(Arc::new(config)));

    let mut tasks = Vec::with_capacity(args.batch.len());
    for path in args.batch {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("Read batch file {:?}", path))?;
        let dispatcher = Arc::clone(&dispatcher);
        let credentials = credentials.clone();
        tasks.push(tokio::spawn(async move {
            match parse_batch(&raw) {
                Ok(batch) => dispatcher.process(&batch, credentials).await,
                Err(response) => {
                    warn!("Batch document {:?} is malformed", path);
                    response
                }
            }
        }));
    }

    let mut failed = false;
    for task in tasks {
        match task.await {
            Ok(response) => {
                let out = serde_yaml::to_string(&response).context("Serialize batch response")?;
                println!("---\n{}", out.trim_end());
            }
            Err(e) => {
                error!("Batch task failed: {}", e);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("one or more batches did not complete");
    }
    Ok(())
}
