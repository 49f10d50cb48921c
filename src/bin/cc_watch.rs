//! cc-watch - 终端观察者
//!
//! 通过 Socket 传输连接服务，定期输出会话 / 项目汇总。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use command_center::{
    select_transport, ConnectionState, Event, Reconciler, ReconcilerConfig, ReconcilerListener,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 汇总输出间隔
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// 把关键事件写到日志
struct LogListener;

impl ReconcilerListener for LogListener {
    fn on_event(&self, event: &Event) {
        if let Some(verdict) = event.field("verdict").and_then(|v| v.as_str()) {
            tracing::info!(
                "🧭 {} {} verdict={} (session {})",
                event.hook_event_type,
                event.source_app,
                verdict,
                event.session_id
            );
        }
    }

    fn on_session_deleted(&self, session_id: &str) {
        tracing::info!("🗑️ Session deleted: {}", session_id);
    }

    fn on_events_cleared(&self) {
        tracing::info!("🧹 Events cleared");
    }
}

fn report(reconciler: &Reconciler) {
    let projects = reconciler.projects();
    tracing::info!(
        "📊 {} events, {} projects ({})",
        reconciler.event_count(),
        projects.len(),
        reconciler.connection_state()
    );
    for project in projects {
        tracing::info!(
            "  📁 {} sessions={} events={} tokens={} cost=${:.6} last={}",
            project.source_app,
            project.sessions.len(),
            project.totals.event_count,
            project.totals.tokens_used,
            project.totals.cost_usd(),
            project.last_activity.as_deref().unwrap_or("-")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("command_center=info".parse()?))
        .init();

    let config = ReconcilerConfig::from_env();
    tracing::info!("👀 cc-watch v{} → {}", command_center::VERSION, config.server_url);

    let transport = select_transport(&config, None)?;
    let reconciler = Reconciler::new(transport, config)?.with_listener(Arc::new(LogListener));
    reconciler.start();

    let mut state = reconciler.watch_state();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Connected {
                    report(&reconciler);
                }
            }
            _ = ticker.tick() => report(&reconciler),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到中断信号，准备退出...");
                break;
            }
        }
    }

    reconciler.shutdown();
    Ok(())
}
