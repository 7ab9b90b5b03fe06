//! Foreman - mail ingestion for home-construction projects
//!
//! Operator entry point: feeds change notifications into the sync engine and
//! manages the mailbox grants of projects.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use ingest::models::IssuanceContext;
use ingest::{
    IngestError, IngestSettings, ProjectId, RevocationReason, RevocationRequest, UserId,
    verification_response,
};
use log::error;

mod app;

use app::ForemanApp;

const USAGE: &str = "\
Usage: foreman <command> [args]

Commands:
  notify [FILE]                                  Process a push envelope (stdin if no FILE)
  verify <QUERY>                                 Answer a subscription verification request
  authorize-url <PROJECT> <REDIRECT_URI>         Print the consent URL for a project
  connect <PROJECT> <USER> <CODE> <REDIRECT_URI> Exchange a consent code and grant access
  check-auth <PROJECT>                           Exit non-zero if reauthorization is required
  compliance <PROJECT>                           Print the grant compliance report
  revoke <PROJECT> <ACTOR> <REASON> [DETAILS]    Revoke a project's grant";

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<IngestError>() {
                Some(IngestError::Validation(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("Missing <{}>\n\n{}", name, USAGE))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(args: &[String]) -> Result<ExitCode> {
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(ExitCode::SUCCESS);
    };

    match command.as_str() {
        "notify" => {
            let body = match args.get(1) {
                Some(path) => std::fs::read(path)
                    .with_context(|| format!("Failed to read envelope from {}", path))?,
                None => {
                    let mut body = Vec::new();
                    std::io::stdin().read_to_end(&mut body)?;
                    body
                }
            };
            let app = ForemanApp::open()?;
            let outcome = app.synchronizer()?.handle_notification(&body)?;
            print_json(&outcome)?;
        }
        "verify" => {
            let query = arg(args, 1, "QUERY")?;
            let settings = IngestSettings::load()?;
            let challenge = verification_response(query, settings.verification_token.as_deref())?;
            println!("{}", challenge);
        }
        "authorize-url" => {
            let project = arg(args, 1, "PROJECT")?;
            let redirect_uri = arg(args, 2, "REDIRECT_URI")?;
            let app = ForemanApp::open()?;
            println!("{}", app.gmail_auth()?.authorization_url(redirect_uri, project));
        }
        "connect" => {
            let project = ProjectId::new(arg(args, 1, "PROJECT")?);
            let user = UserId::new(arg(args, 2, "USER")?);
            let code = arg(args, 3, "CODE")?;
            let redirect_uri = arg(args, 4, "REDIRECT_URI")?;

            let app = ForemanApp::open()?;
            let Some(stored) = app.store.get_project(&project)? else {
                bail!("Project {} not found", project);
            };
            if stored.owner_id != user {
                bail!("User {} does not own project {}", user, project);
            }

            let tokens = app.gmail_auth()?.exchange_code(code, redirect_uri)?;
            let session = app.grants.create_grant(
                &project,
                &user,
                tokens,
                vec![ingest::GmailAuth::GMAIL_READONLY_SCOPE.to_string()],
                IssuanceContext {
                    source: "cli".to_string(),
                    ..Default::default()
                },
            )?;
            println!("{}", session);
        }
        "check-auth" => {
            let project = ProjectId::new(arg(args, 1, "PROJECT")?);
            let app = ForemanApp::open()?;
            if app.grants.check_reauthorization_required(&project) {
                println!("reauthorization required");
                return Ok(ExitCode::FAILURE);
            }
            println!("ok");
        }
        "compliance" => {
            let project = ProjectId::new(arg(args, 1, "PROJECT")?);
            let app = ForemanApp::open()?;
            print_json(&app.grants.compliance_report(&project)?)?;
        }
        "revoke" => {
            let project = ProjectId::new(arg(args, 1, "PROJECT")?);
            let actor = arg(args, 2, "ACTOR")?;
            let reason_name = arg(args, 3, "REASON")?;
            let Some(reason) = RevocationReason::parse(reason_name) else {
                bail!(
                    "Unknown reason {:?}; expected security, user_request, token_expired, \
                     policy_violation or reauthorization",
                    reason_name
                );
            };

            let mut request = RevocationRequest::new(actor, reason);
            if let Some(details) = args.get(4) {
                request = request.with_details(details.as_str());
            }

            let app = ForemanApp::open()?;
            app.grants.revoke_grant(&project, request)?;
            println!("revoked");
        }
        "help" | "--help" | "-h" => println!("{}", USAGE),
        other => bail!("Unknown command {:?}\n\n{}", other, USAGE),
    }

    Ok(ExitCode::SUCCESS)
}
