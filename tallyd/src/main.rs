use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Builder as RuntimeBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ledger_core::{ExpenseId, GroupId, Money, ScopeId, UserId};
use ledger_store::Cursor;
use settlement_service::{Config, Core, NewExpense, PlanTarget, ServiceError};

const PROTOCOL_VERSION: u32 = 1;

/// Shared-expense settlement daemon. Reads one JSON request per line on
/// stdin and writes one JSON response per line on stdout; logs go to stderr.
#[derive(Parser)]
#[command(name = "tallyd")]
struct Args {
    /// Data directory; overrides STORE_URL.
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RequestEnvelope {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug)]
struct RpcError {
    slug: String,
    message: String,
    retry_after: Option<u64>,
}

type RpcResult<T> = std::result::Result<T, RpcError>;

impl RpcError {
    fn protocol(slug: &str, message: impl Into<String>) -> Self {
        RpcError {
            slug: slug.to_string(),
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        RpcError {
            slug: err.slug().to_string(),
            retry_after: err.retry_after_secs(),
            message: err.to_string(),
        }
    }
}

struct StoreLock {
    _file: File,
    _path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Some(store) = &args.store {
        std::env::set_var("STORE_URL", store);
    }
    let config = Config::from_env().context("invalid configuration")?;
    let _store_lock = acquire_store_lock(&config.store_path)?;

    let runtime = RuntimeBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let core = runtime
        .block_on(async { Core::open(&config) })
        .map_err(|err| anyhow::anyhow!(err.to_string()))
        .context("failed to open settlement core")?;

    info!(store = %config.store_path.display(), cache = core.cache.is_enabled(), "tallyd ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("tallyd stdin error: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(request) => handle_request(&runtime, &core, request),
            Err(err) => ResponseEnvelope {
                id: Value::Null,
                ok: false,
                result: None,
                error: Some(ErrorBody {
                    error: "invalid_request".to_string(),
                    message: Some(format!("invalid request: {err}")),
                    retry_after: None,
                }),
            },
        };

        let payload = serde_json::to_string(&response)?;
        writeln!(stdout, "{payload}")?;
        stdout.flush()?;
    }

    // Give invalidation and activity jobs a moment to drain before exit.
    runtime.block_on(core.jobs.wait_idle(std::time::Duration::from_secs(5)));
    Ok(())
}

fn acquire_store_lock(store_path: &Path) -> Result<StoreLock> {
    std::fs::create_dir_all(store_path)?;
    let lock_path = store_path.join("tallyd.lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    if let Err(err) = file.try_lock_exclusive() {
        if err.kind() == ErrorKind::WouldBlock {
            anyhow::bail!("data directory is already served by another tallyd");
        }
        return Err(err.into());
    }
    Ok(StoreLock {
        _file: file,
        _path: lock_path,
    })
}

fn handle_request(
    runtime: &tokio::runtime::Runtime,
    core: &Core,
    request: RequestEnvelope,
) -> ResponseEnvelope {
    let result = dispatch(runtime, core, &request.method, request.params);
    match result {
        Ok(value) => ResponseEnvelope {
            id: request.id,
            ok: true,
            result: Some(value),
            error: None,
        },
        Err(err) => ResponseEnvelope {
            id: request.id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                error: err.slug,
                message: Some(err.message),
                retry_after: err.retry_after,
            }),
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseGetParams {
    id: ExpenseId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseListParams {
    scope: ScopeId,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleParams {
    scope: ScopeId,
    debtor_id: UserId,
    creditor_id: UserId,
    amount: Money,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecomputeParams {
    scope: ScopeId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserParams {
    user_id: UserId,
    #[serde(default)]
    fresh: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeParams {
    scope: ScopeId,
    #[serde(default)]
    fresh: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupCreateParams {
    name: String,
    creator_id: UserId,
    #[serde(default)]
    members: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberParams {
    group_id: GroupId,
    actor_id: UserId,
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupActorParams {
    group_id: GroupId,
    actor_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupGetParams {
    group_id: GroupId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityListParams {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn dispatch(
    runtime: &tokio::runtime::Runtime,
    core: &Core,
    method: &str,
    params: Value,
) -> RpcResult<Value> {
    match method {
        "expense.post" => {
            let request: NewExpense = parse_params(params)?;
            let expense = runtime.block_on(core.ledger.post_expense(request))?;
            to_json(expense)
        }
        "expense.get" => {
            let params: ExpenseGetParams = parse_params(params)?;
            to_json(core.ledger.get_expense(&params.id)?)
        }
        "expense.list" => {
            let params: ExpenseListParams = parse_params(params)?;
            let cursor = decode_cursor(params.cursor.as_deref())?;
            let limit = ledger_store::cursor::clamp_limit(params.limit);
            to_json(core.ledger.list_expenses(&params.scope, cursor.as_ref(), limit))
        }
        "ledger.settle" => {
            let params: SettleParams = parse_params(params)?;
            let settlement = runtime.block_on(core.ledger.settle(
                &params.scope,
                &params.debtor_id,
                &params.creditor_id,
                params.amount,
            ))?;
            to_json(settlement)
        }
        "ledger.recompute" => {
            let params: RecomputeParams = parse_params(params)?;
            let rows = runtime.block_on(core.ledger.recompute(&params.scope))?;
            Ok(json!({ "rows": rows }))
        }
        "balances.user" => {
            let params: UserParams = parse_params(params)?;
            let view =
                runtime.block_on(core.aggregation.user_view(&params.user_id, params.fresh))?;
            to_json(view)
        }
        "balances.scope" => {
            let params: ScopeParams = parse_params(params)?;
            let matrix =
                runtime.block_on(core.aggregation.scope_matrix(&params.scope, params.fresh))?;
            to_json(matrix)
        }
        "plan.scope" => {
            let params: ScopeParams = parse_params(params)?;
            let plan = runtime.block_on(
                core.aggregation
                    .plan(&PlanTarget::Scope(params.scope), params.fresh),
            )?;
            to_json(plan)
        }
        "plan.user" => {
            let params: UserParams = parse_params(params)?;
            let plan = runtime.block_on(
                core.aggregation
                    .plan(&PlanTarget::User(params.user_id), params.fresh),
            )?;
            to_json(plan)
        }
        "group.create" => {
            let params: GroupCreateParams = parse_params(params)?;
            let group =
                core.ledger
                    .create_group(&params.name, &params.creator_id, &params.members)?;
            to_json(group)
        }
        "group.add_member" => {
            let params: AddMemberParams = parse_params(params)?;
            core.ledger
                .add_member(&params.group_id, &params.actor_id, &params.user_id)?;
            Ok(json!({ "added": true }))
        }
        "group.delete" => {
            let params: GroupActorParams = parse_params(params)?;
            core.ledger.delete_group(&params.group_id, &params.actor_id)?;
            Ok(json!({ "deleted": true }))
        }
        "group.get" => {
            let params: GroupGetParams = parse_params(params)?;
            to_json(core.ledger.get_group(&params.group_id)?)
        }
        "activity.list" => {
            let params: ActivityListParams = parse_params(params)?;
            let cursor = decode_cursor(params.cursor.as_deref())?;
            let limit = ledger_store::cursor::clamp_limit(params.limit);
            to_json(core.ledger.list_activity(cursor.as_ref(), limit))
        }
        "status.get" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "cacheEnabled": core.cache.is_enabled(),
            "pendingJobs": core.jobs.pending(),
            "failedJobs": core.jobs.failed().len(),
        })),
        _ => Err(RpcError::protocol(
            "unknown_method",
            format!("unknown method {method}"),
        )),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> RpcResult<T> {
    serde_json::from_value(params)
        .map_err(|err| RpcError::protocol("invalid_params", format!("invalid params: {err}")))
}

fn decode_cursor(raw: Option<&str>) -> RpcResult<Option<Cursor>> {
    match raw {
        Some(raw) => Cursor::decode(raw)
            .map(Some)
            .map_err(|_| RpcError::protocol("invalid_params", "invalid pagination cursor")),
        None => Ok(None),
    }
}

fn to_json<T: Serialize>(value: T) -> RpcResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| RpcError::protocol("internal", format!("serialization failed: {err}")))
}
