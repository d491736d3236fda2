//! TDF Access - authentication, authorization and key-access reasoning service

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{error, info};

use tdf_access_core::{
    auth::{AccessToken, StaticRoleProvider},
    authz::{AuthorizationRequest, AuthorizerRegistry, AuthorizerSettings, ResolverContext, rpc_action},
    cli::{Cli, Command},
    config::Config,
    reasoner::{AttributeValueFqn, GrantTable, Granter, ReasonerInput, select_hierarchy},
    server::AccessServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Reason { ref file }) => run_reason(file),
        Some(Command::Check {
            ref roles,
            ref username,
            ref rpc,
            ref action,
            ref dims,
        }) => run_check(&cli, roles, username.as_deref(), rpc, action.as_deref(), dims).await,
        Some(Command::Serve { port, ref host }) => run_server(&cli, port, host.clone()).await,
        None => run_server(&cli, None, None).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the access server until a shutdown signal arrives
async fn run_server(cli: &Cli, port: Option<u16>, host: Option<String>) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        auth = config.auth.enabled,
        authz = %config.authz.version,
        "Starting TDF access server"
    );

    AccessServer::new(config).await?.run().await?;
    Ok(ExitCode::SUCCESS)
}

/// Print the reduced key expression and split plan for a policy file
fn run_reason(file: &std::path::Path) -> anyhow::Result<ExitCode> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let input: ReasonerInput =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let table = GrantTable::from_specs(input.definitions)?;
    let policy = input
        .policy
        .iter()
        .map(|fqn| AttributeValueFqn::parse(fqn))
        .collect::<tdf_access_core::Result<Vec<_>>>()?;
    let tags = select_hierarchy(&table, &policy);

    let granter = Granter::new(&table, tags);
    println!("expression: {}", granter.reduced()?);

    let plan = granter.plan(&input.default_kas, || uuid::Uuid::new_v4().to_string())?;
    println!("plan:");
    for step in plan {
        if step.split_id.is_empty() {
            println!("  - kas: {}", step.kas);
        } else {
            println!("  - kas: {}\n    split: {}", step.kas, step.split_id);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Evaluate the configured authorizer for a synthetic caller
async fn run_check(
    cli: &Cli,
    roles: &[String],
    username: Option<&str>,
    rpc: &str,
    action: Option<&str>,
    dims: &[(String, String)],
) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let username_claim = config.auth.username_claim.clone();

    let settings = AuthorizerSettings {
        authz: config.authz.clone(),
        roles: Arc::new(StaticRoleProvider::new(roles.to_vec())),
        username_claim: username_claim.clone(),
    };
    let authorizer = AuthorizerRegistry::new().build(&settings).await?;

    let mut claims = Map::new();
    claims.insert("sub".to_string(), Value::String("tdf-access-check".to_string()));
    if let (Some(name), Some(claim)) = (username, username_claim.as_deref()) {
        claims.insert(claim.to_string(), Value::String(name.to_string()));
    }
    let token = AccessToken::from_claims(claims);

    let mut context = ResolverContext::new();
    if !dims.is_empty() {
        let resource = context.new_resource();
        for (key, value) in dims {
            resource.add_dimension(key.clone(), value.clone());
        }
    }

    let action = action.unwrap_or_else(|| rpc_action(rpc));
    let request = AuthorizationRequest {
        token: Some(&token),
        userinfo: None,
        rpc,
        action,
        resource_context: (!dims.is_empty()).then_some(&context),
    };
    let decision = authorizer.authorize(&request).await?;

    println!("mode:     {}", decision.mode);
    println!("action:   {action}");
    if !dims.is_empty() {
        println!("dims:     {}", context.dimensions());
    }
    println!("allowed:  {}", decision.allowed);
    println!("reason:   {}", decision.reason);
    if let Some(policy) = decision.matched_policy {
        println!("matched:  {policy}");
    }

    Ok(if decision.allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
