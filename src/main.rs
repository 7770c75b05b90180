// ==========================================
// 维修准备排产系统 - 命令行入口
// ==========================================
// 输入: JSON 文件; 输出: stdout 上的 JSON
// 日志: stderr (RUST_LOG 控制级别)
// ==========================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mro_prep_aps::api::{ApiError, GeneratePlanRequest, RolloutRequest};
use mro_prep_aps::app::{get_default_db_path, AppState};
use mro_prep_aps::config::{PriorityTemplate, TemplateRef, WeightOverrides};
use mro_prep_aps::domain::{DomainEvent, Evidence};
use mro_prep_aps::engine::PreemptionRequest;
use mro_prep_aps::logging;

/// 维修准备排产: 生成计划、事件重排、交接确认、抢占
#[derive(Parser)]
#[command(name = "mro-prep-aps", version)]
struct Cli {
    /// SQLite 数据库路径 (缺省: MRO_PREP_APS_DB_PATH 或用户数据目录)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// 以 JSON 行格式输出日志
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 根据快照生成计划 (输入: GeneratePlanRequest JSON)
    Generate {
        #[arg(long)]
        input: PathBuf,
    },
    /// 应用领域事件并重排 (输入: DomainEvent 数组 JSON)
    ApplyEvents {
        #[arg(long)]
        plan_id: String,
        #[arg(long)]
        input: PathBuf,
    },
    /// 计划摘要: 门禁通过率/预计就绪/SLA 风险/关键路径
    Summarize {
        #[arg(long)]
        plan_id: String,
    },
    /// 提交交接证据 (输入: Evidence 数组 JSON)
    ConfirmHandover {
        #[arg(long)]
        plan_id: String,
        /// 门禁 ID 或门禁任务 ID
        #[arg(long)]
        prep_id: String,
        #[arg(long)]
        evidence: PathBuf,
    },
    /// 为工作包发起抢占
    Preempt {
        #[arg(long)]
        plan_id: String,
        #[arg(long)]
        work_package_id: String,
        #[arg(long)]
        approver: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// 扫描资源池内满足抢占触发条件的工作包
    PreemptionCandidates {
        #[arg(long)]
        plan_id: String,
    },
    /// 查看计划版本 (缺省最新)
    Show {
        #[arg(long)]
        plan_id: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// 查看计划的事件日志与抢占记录
    History {
        #[arg(long)]
        plan_id: String,
    },
    /// 应用目标模板 (全局或按工作包作用域)
    ApplyTemplate {
        #[arg(long)]
        template: PriorityTemplate,
        /// 逗号分隔的工作包 ID; 缺省为全局
        #[arg(long, value_delimiter = ',')]
        scope: Option<Vec<String>>,
        /// 权重覆盖 JSON 文件
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// 启动灰度发布 (输入: RolloutRequest JSON)
    StartRollout {
        #[arg(long)]
        input: PathBuf,
    },
    /// 灰度转正
    PromoteRollout,
    /// 灰度回滚
    RollbackRollout,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("无法读取文件: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("JSON 解析失败: {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// API 错误以结构化 JSON 输出, 便于调用方据此重试/放宽/审批
fn report_api_error(err: &ApiError) -> Result<()> {
    let body = serde_json::json!({
        "error": err.to_string(),
        "retryable": err.is_retryable(),
        "blocking_constraints": err.blocking_constraints(),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn run(state: &AppState, command: Command) -> Result<std::result::Result<(), ApiError>> {
    macro_rules! emit {
        ($call:expr) => {
            match $call {
                Ok(value) => {
                    print_json(&value)?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
    }

    let outcome = match command {
        Command::Generate { input } => {
            let request: GeneratePlanRequest = read_json(&input)?;
            emit!(state.plan_api.generate_plan(request))
        }
        Command::ApplyEvents { plan_id, input } => {
            let events: Vec<DomainEvent> = read_json(&input)?;
            emit!(state.plan_api.apply_events(&plan_id, events))
        }
        Command::Summarize { plan_id } => emit!(state.plan_api.summarize(&plan_id)),
        Command::ConfirmHandover {
            plan_id,
            prep_id,
            evidence,
        } => {
            let evidence: Vec<Evidence> = read_json(&evidence)?;
            emit!(state.plan_api.confirm_handover(&plan_id, &prep_id, evidence))
        }
        Command::Preempt {
            plan_id,
            work_package_id,
            approver,
            reason,
        } => emit!(state.plan_api.preempt(
            &plan_id,
            PreemptionRequest {
                work_package_id,
                approver,
                reason,
            }
        )),
        Command::PreemptionCandidates { plan_id } => emit!(state.plan_api.preemption_candidates(&plan_id)),
        Command::Show { plan_id, version } => emit!(state.plan_api.get_plan(&plan_id, version)),
        Command::History { plan_id } => {
            let history = state
                .plan_api
                .event_history(&plan_id)
                .and_then(|events| Ok((events, state.plan_api.preemption_history(&plan_id)?)));
            emit!(history.map(|(events, preemptions)| serde_json::json!({
                "events": events,
                "preemptions": preemptions,
            })))
        }
        Command::ApplyTemplate {
            template,
            scope,
            overrides,
        } => {
            let overrides: WeightOverrides = match overrides {
                Some(path) => read_json(&path)?,
                None => WeightOverrides::default(),
            };
            emit!(state
                .config_api
                .apply_template(TemplateRef { template, overrides }, scope))
        }
        Command::StartRollout { input } => {
            let request: RolloutRequest = read_json(&input)?;
            emit!(state.config_api.start_rollout(request))
        }
        Command::PromoteRollout => emit!(state.config_api.promote_rollout()),
        Command::RollbackRollout => emit!(state.config_api.rollback_rollout()),
    };
    Ok(outcome)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_log {
        logging::init_json();
    } else {
        logging::init();
    }

    let db_path = match &cli.db {
        Some(path) => path.to_string_lossy().to_string(),
        None => get_default_db_path(),
    };
    tracing::info!(version = mro_prep_aps::VERSION, db_path = %db_path, "{}", mro_prep_aps::APP_NAME);

    let state = AppState::new(db_path).map_err(anyhow::Error::msg)?;
    if let Err(err) = run(&state, cli.command)? {
        tracing::warn!(error = %err, "请求失败");
        report_api_error(&err)?;
        std::process::exit(if err.is_retryable() { 75 } else { 2 });
    }
    Ok(())
}
