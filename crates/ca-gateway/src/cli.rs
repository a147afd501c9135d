//! CLI (Command Line Interface) mode
//!
//! Interactive REPL for inspecting and steering the running scheduler.
//! Alerts keep firing in the background while the prompt is open.

use ca_core::{ScheduledEntry, SyncFrequency, SyncState};
use ca_schedule::{CycleOutcome, CycleReport};
use chrono::{DateTime, Local, Utc};
use nu_ansi_term::{Color, Style};
use reedline::{
    ColumnarMenu, Completer, DefaultHinter, Emacs, KeyCode, KeyModifiers, Keybindings,
    MenuBuilder, Prompt, Reedline, ReedlineEvent, ReedlineMenu, Signal, Suggestion,
};
use std::borrow::Cow;
use std::collections::BTreeSet;
use tracing::info;

use crate::app::Gateway;

/// Available commands for autocomplete display
const COMMANDS: &[(&str, &str)] = &[
    ("/status", "同期状態と前回の結果を表示"),
    ("/pending", "予約済みタスクを表示"),
    ("/sync", "今すぐ同期"),
    ("/frequency", "同期間隔を表示・変更 (15/30/60/180/360)"),
    ("/calendars", "対象カレンダーを表示・変更 (id,id,...)"),
    ("/help", "ヘルプを表示"),
    ("/exit", "プログラムを終了"),
];

/// A parsed REPL command
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Status,
    Pending,
    Sync,
    /// `None` shows the current value
    Frequency(Option<SyncFrequency>),
    /// `None` shows the current selection
    Calendars(Option<BTreeSet<String>>),
    Help,
    Exit,
}

fn parse_command(input: &str) -> Result<Command, String> {
    let mut parts = input.trim().splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    match name.as_str() {
        "/status" => Ok(Command::Status),
        "/pending" => Ok(Command::Pending),
        "/sync" => Ok(Command::Sync),
        "/frequency" => match arg {
            None => Ok(Command::Frequency(None)),
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| format!("分数を指定してください: {}", raw))
                .and_then(|m| SyncFrequency::try_from(m).map_err(|e| e.to_string()))
                .map(|f| Command::Frequency(Some(f))),
        },
        "/calendars" => Ok(Command::Calendars(arg.map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }))),
        "/help" | "/?" => Ok(Command::Help),
        "/exit" | "/quit" | "/q" => Ok(Command::Exit),
        _ => Err(format!(
            "不明なコマンド: {}。/help でコマンド一覧を確認してください。",
            input
        )),
    }
}

/// Command completer for reedline
#[derive(Clone)]
pub struct CommandCompleter {
    commands: Vec<(&'static str, &'static str)>,
}

impl CommandCompleter {
    pub fn new() -> Self {
        Self {
            commands: COMMANDS.to_vec(),
        }
    }
}

impl Default for CommandCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl Completer for CommandCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        // 行頭が / で始まる場合は常に候補を表示
        if !line.starts_with('/') {
            return Vec::new();
        }

        self.commands
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(line))
            .map(|(cmd, desc)| Suggestion {
                value: cmd.to_string(),
                description: Some(desc.to_string()),
                span: reedline::Span::new(0, pos),
                append_whitespace: true,
                ..Default::default()
            })
            .collect()
    }
}

/// Custom prompt with colored styling
struct ColoredPrompt {
    style: Style,
}

impl ColoredPrompt {
    fn new() -> Self {
        Self {
            style: Color::Cyan.bold(),
        }
    }
}

impl Prompt for ColoredPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Owned(self.style.paint("ca> ").to_string())
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: reedline::PromptHistorySearch,
    ) -> Cow<'_, str> {
        Cow::Borrowed("")
    }
}

/// Run CLI interactive mode
pub async fn run_cli(gateway: &Gateway) -> anyhow::Result<()> {
    info!("Starting CLI mode");
    print_welcome();

    let mut keybindings = default_keybindings();
    // Trigger completion on '/' key
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Char('/'),
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );

    let menu = Box::new(
        ColumnarMenu::default()
            .with_name("command_menu")
            .with_columns(1)
            .with_column_width(Some(50))
            .with_only_buffer_difference(false),
    );
    let hinter = DefaultHinter::default().with_style(Style::new().dimmed());

    let mut line_editor = Reedline::create()
        .with_completer(Box::new(CommandCompleter::new()))
        .with_menu(ReedlineMenu::EngineCompleter(menu))
        .with_hinter(Box::new(hinter))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    let prompt = ColoredPrompt::new();

    loop {
        match line_editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                match parse_command(input) {
                    Ok(Command::Exit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(gateway, command).await {
                            eprintln!("\n❌ エラー: {}\n", e);
                        }
                    }
                    Err(message) => eprintln!("\n❓ {}\n", message),
                }
            }
            Ok(Signal::CtrlC) => {
                println!("^C");
                continue;
            }
            Ok(Signal::CtrlD) => break,
            Err(err) => {
                eprintln!("\n❌ エラー: {}\n", err);
                break;
            }
        }
    }

    println!("\n👋 さようなら！\n");
    Ok(())
}

async fn execute(gateway: &Gateway, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => print_status(gateway)?,
        Command::Pending => print_pending(&gateway.scheduler.pending()?),
        Command::Sync => {
            gateway.request_sync()?;
            println!("\n🔄 同期を開始しました。結果は /status で確認できます。\n");
        }
        Command::Frequency(None) => {
            let state = gateway.sync_state()?;
            let options: Vec<String> = SyncFrequency::ALL.iter().map(|f| f.to_string()).collect();
            println!("\n⏱️ 同期間隔: {} (選択肢: {})\n", state.sync_frequency, options.join(", "));
        }
        Command::Frequency(Some(frequency)) => {
            SyncState::set_frequency(gateway.settings.as_ref(), frequency)?;
            gateway.request_sync()?;
            println!("\n✅ 同期間隔を {} に変更しました。\n", frequency);
        }
        Command::Calendars(None) => {
            let state = gateway.sync_state()?;
            println!();
            println!("📅 選択中: {}", format_ids(&state.selected_calendar_ids));
            match gateway.local.list_calendars().await {
                Ok(available) => println!("📂 利用可能: {}", available.join(", ")),
                Err(e) => println!("📂 {} を読めません: {}", gateway.local.root().display(), e),
            }
            println!();
        }
        Command::Calendars(Some(ids)) => {
            SyncState::set_selected_calendars(gateway.settings.as_ref(), &ids)?;
            gateway.request_sync()?;
            println!("\n✅ 対象カレンダーを {} に変更しました。\n", format_ids(&ids));
        }
        Command::Help => print_help(),
        Command::Exit => {}
    }
    Ok(())
}

/// Default keybindings for reedline
fn default_keybindings() -> Keybindings {
    let mut keybindings = Keybindings::new();
    // Tab key triggers completion
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Enter, ReedlineEvent::Submit);
    // Esc key clears/closes menus
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Esc, ReedlineEvent::Esc);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('c'), ReedlineEvent::CtrlC);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('d'), ReedlineEvent::CtrlD);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Up, ReedlineEvent::Up);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Down, ReedlineEvent::Down);
    keybindings
}

fn local_time(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_ids(ids: &BTreeSet<String>) -> String {
    if ids.is_empty() {
        "(なし)".to_string()
    } else {
        ids.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Print the result of one sync cycle
pub fn print_report(report: &CycleReport) {
    match &report.outcome {
        CycleOutcome::Success => println!("✅ 同期成功 ({})", local_time(report.started_at)),
        CycleOutcome::Failed(reason) => {
            println!("❌ 同期失敗 ({}): {}", local_time(report.started_at), reason)
        }
    }
    println!(
        "   イベント: {} (リモート {}), 予約したアラート: {}, 保存失敗: {}",
        report.events_fetched, report.remote_events, report.alerts_scheduled, report.store_failures
    );
    if let Some(error) = &report.remote_error {
        println!("   リモート取得をスキップ: {}", error);
    }
    match report.next_sync_at {
        Some(next) => println!("   次回同期: {}", local_time(next)),
        None => println!("   次回同期: 予約できませんでした"),
    }
}

fn print_status(gateway: &Gateway) -> anyhow::Result<()> {
    let state = gateway.sync_state()?;

    println!();
    println!("📊 状態: {}", gateway.orchestrator.phase());
    println!(
        "   前回同期: {}",
        state
            .last_sync_at
            .map(local_time)
            .unwrap_or_else(|| "未実行".to_string())
    );
    println!("   同期間隔: {}", state.sync_frequency);
    println!("   カレンダー: {}", format_ids(&state.selected_calendar_ids));
    match &gateway.remote {
        Some(remote) => println!("   リモート: {} ({})", remote.config().username, remote.config().calendar_id()),
        None => println!("   リモート: 未設定"),
    }
    println!();

    if let Some(report) = gateway.orchestrator.last_report() {
        print_report(&report);
        println!();
    }
    Ok(())
}

fn print_pending(entries: &[ScheduledEntry]) {
    println!();
    println!("⏰ 予約済みタスク ({} 件):", entries.len());
    println!("{}", "─".repeat(60));

    for entry in entries {
        let title = entry
            .payload
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("");
        println!(
            "{}  {:<20} {} {}",
            local_time(entry.fire_at),
            entry.task_type,
            entry.key,
            title
        );
    }

    println!("{}", "─".repeat(60));
    println!();
}

/// Print welcome message
fn print_welcome() {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║          📅 ca-gateway CLI - 対話モード                    ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  コマンド: /status, /pending, /sync, /help, /exit          ║");
    println!("║  / を入力するとコマンド候補が表示されます                   ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

/// Print help message
fn print_help() {
    println!();
    println!("📖 利用可能なコマンド:");
    for (cmd, desc) in COMMANDS {
        println!("  {} - {}", cmd, desc);
    }
    println!();
    println!("💡 ヒント: / から入力するとコマンド候補が表示されます");
    println!();
}
