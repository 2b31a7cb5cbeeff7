//! REPL – Read-Eval-Print Loop for chatting with the companion.
//!
//! Anything that is not a slash-command is sent as a message. Supported
//! slash-commands:
//!   /help            – show this list
//!   /history         – print the current session's conversation
//!   /affect          – show mood, trust and energy (add `history` for the trail)
//!   /event [key]     – trigger an ambient event (`day`, `night`, ...)
//!   /plan <task>     – ask for a step-by-step plan
//!   /session [id]    – show or switch the active session
//!   /sessions        – list stored and open sessions
//!   /reindex         – rebuild the semantic index from the log
//!   /models          – list models on the configured server
//!   /stats           – memory write/retrieval counters
//!   /quit | /exit    – gracefully exit

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use kindred_runtime::{LlmDriver, Orchestrator, Reply};
use kindred_types::{AffectVector, Role, SessionId, Turn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;

/// How many snapshots `/affect history` prints.
const AFFECT_TRAIL: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    History,
    Affect { trail: bool },
    Event { key: Option<String> },
    Session(Option<String>),
    Sessions,
    Reindex,
    Models,
    Stats,
    Quit,
    /// Plain text, or a `/plan` directive the runtime routes itself.
    Say(String),
    Unknown(String),
}

pub(crate) fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(line.to_string()));
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());
    Some(match head {
        "/help" => Command::Help,
        "/history" => Command::History,
        "/affect" => Command::Affect { trail: rest == "history" },
        "/event" => Command::Event { key: arg },
        "/plan" if arg.is_some() => Command::Say(line.to_string()),
        "/session" => Command::Session(arg),
        "/sessions" => Command::Sessions,
        "/reindex" => Command::Reindex,
        "/models" => Command::Models,
        "/stats" => Command::Stats,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    })
}

/// Interactive loop state.
pub struct Repl {
    rt: Arc<Runtime>,
    orchestrator: Arc<Orchestrator>,
    driver: Arc<LlmDriver>,
    session: SessionId,
}

impl Repl {
    pub fn new(
        rt: Arc<Runtime>,
        orchestrator: Arc<Orchestrator>,
        driver: Arc<LlmDriver>,
        session: SessionId,
    ) -> Self {
        Self {
            rt,
            orchestrator,
            driver,
            session,
        }
    }

    /// Run until `/quit`, EOF, or `shutdown` is set.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> rustyline::Result<()> {
        let mut editor = DefaultEditor::new()?;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let prompt = format!("{} ", format!("{}>", self.session).bold().cyan());
            let line = match editor.readline(&prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "(type /quit to exit)".dimmed());
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e),
            };
            let Some(command) = parse_command(&line) else {
                continue;
            };
            let _ = editor.add_history_entry(line.trim());
            if command == Command::Quit {
                break;
            }
            self.dispatch(command);
        }
        println!("{}", "Goodbye.".green());
        Ok(())
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Help => cmd_help(),
            Command::History => self.cmd_history(),
            Command::Affect { trail } => self.cmd_affect(trail),
            Command::Event { key } => self.cmd_event(key),
            Command::Session(id) => self.cmd_session(id),
            Command::Sessions => self.cmd_sessions(),
            Command::Reindex => self.cmd_reindex(),
            Command::Models => self.cmd_models(),
            Command::Stats => self.cmd_stats(),
            Command::Say(text) => self.cmd_say(&text),
            Command::Unknown(other) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            ),
            Command::Quit => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Command handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn cmd_say(&self, text: &str) {
        match self.rt.block_on(self.orchestrator.handle_message(&self.session, text)) {
            Ok(reply) => self.print_reply(&reply),
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }

    fn print_reply(&self, reply: &Reply) {
        let name = &self.orchestrator.persona().name;
        println!("{} {}", format!("{name}:").bold().magenta(), reply.reply);
        println!("  {}", affect_line(reply.affect).dimmed());
    }

    fn cmd_history(&self) {
        match self.orchestrator.history(&self.session) {
            Ok(turns) if turns.is_empty() => println!("  {}", "(no turns yet)".dimmed()),
            Ok(turns) => {
                let name = self.orchestrator.persona().name.clone();
                for turn in &turns {
                    println!("{}", history_line(turn, &name));
                }
            }
            Err(e) => println!("{}: {}", "Error reading history".red(), e),
        }
    }

    fn cmd_affect(&self, trail: bool) {
        if trail {
            let snapshots = self.rt.block_on(self.orchestrator.affect_history(&self.session));
            if snapshots.is_empty() {
                println!("  {}", "(no affect changes yet)".dimmed());
            }
            let skip = snapshots.len().saturating_sub(AFFECT_TRAIL);
            for snap in &snapshots[skip..] {
                println!(
                    "  {}  {}",
                    snap.timestamp.format("%H:%M:%S").to_string().dimmed(),
                    affect_line(snap.affect)
                );
            }
        } else {
            let affect = self.rt.block_on(self.orchestrator.affect(&self.session));
            println!("  {}", affect_line(affect));
        }
    }

    fn cmd_event(&self, key: Option<String>) {
        let result = match &key {
            Some(k) => self.rt.block_on(self.orchestrator.trigger_keyed_event(&self.session, k)),
            None => self.rt.block_on(self.orchestrator.trigger_event_now(&self.session)),
        };
        match result {
            Ok(Some(turn)) => println!("  {} {}", "✦".yellow(), turn.text.italic()),
            Ok(None) => println!(
                "  {} '{}'",
                "No events for".yellow(),
                key.as_deref().unwrap_or("now")
            ),
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }

    fn cmd_session(&mut self, id: Option<String>) {
        let Some(id) = id else {
            println!("  Active session: {}", self.session.as_str().bold());
            return;
        };
        match SessionId::parse(id) {
            Ok(sid) => {
                println!("  {} {}", "✓ Switched to session".green(), sid.as_str().bold());
                self.session = sid;
            }
            Err(e) => println!("{}: {}", "Invalid session id".red(), e),
        }
    }

    fn cmd_sessions(&self) {
        let open = self.orchestrator.sessions();
        let logged = match self.orchestrator.logged_sessions() {
            Ok(logged) => logged,
            Err(e) => {
                println!("{}: {}", "Cannot list sessions".red(), e);
                return;
            }
        };
        if logged.is_empty() && open.is_empty() {
            println!("  {}", "(no sessions yet)".dimmed());
        }
        let unlogged: Vec<SessionId> = open.iter().filter(|sid| !logged.contains(sid)).cloned().collect();
        for sid in logged.iter().chain(&unlogged) {
            let marker = if *sid == self.session { "▶" } else { " " };
            let state = if open.contains(sid) { "open" } else { "stored" };
            println!("  {} {} {}", marker.green(), sid.as_str(), state.dimmed());
        }
    }

    fn cmd_reindex(&self) {
        match self.rt.block_on(self.orchestrator.reindex(&self.session)) {
            Ok(n) => println!("  {} {} turn(s) re-indexed", "✓".green(), n),
            Err(e) => println!("{}: {}", "Reindex failed".red(), e),
        }
    }

    fn cmd_models(&self) {
        println!("{}", "AI Models".bold().underline());
        println!("  Active model : {}", self.driver.model().yellow());
        match self.rt.block_on(self.driver.list_models()) {
            Ok(models) if models.is_empty() => println!("  {}", "server lists no models".yellow()),
            Ok(models) => {
                for m in &models {
                    let marker = if m == self.driver.model() { "▶" } else { " " };
                    println!("    {} {}", marker.green(), m.bold());
                }
            }
            Err(e) => println!("  {} {}", "offline:".red(), e.to_string().dimmed()),
        }
    }

    fn cmd_stats(&self) {
        let s = self.orchestrator.memory_stats();
        println!("{}", "Memory".bold().underline());
        println!("  stored             : {}", s.stored);
        println!("  indexed            : {}", s.indexed);
        println!("  embed failures     : {}", s.embed_failures);
        println!("  index failures     : {}", s.index_failures);
        println!("  retrieval failures : {}", s.retrieval_failures);
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Kindred Commands".bold().underline());
    println!("  {}        – print this session's conversation", "/history".bold().cyan());
    println!("  {} – current affect, or the recent trail", "/affect [history]".bold().cyan());
    println!("  {}      – trigger an ambient event", "/event [key]".bold().cyan());
    println!("  {}      – ask for a step-by-step plan", "/plan <task>".bold().cyan());
    println!("  {}     – show or switch the active session", "/session [id]".bold().cyan());
    println!("  {}       – list stored and open sessions", "/sessions".bold().cyan());
    println!("  {}        – rebuild the semantic index", "/reindex".bold().cyan());
    println!("  {}         – list models on the server", "/models".bold().cyan());
    println!("  {}          – memory counters", "/stats".bold().cyan());
    println!("  {}    – exit", "/quit  /exit".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting
// ─────────────────────────────────────────────────────────────────────────────

fn affect_line(affect: AffectVector) -> String {
    format!(
        "mood {:.2} · trust {:.2} · energy {:.2}",
        affect.mood, affect.trust, affect.energy
    )
}

fn history_line(turn: &Turn, persona: &str) -> String {
    let time = turn.timestamp.format("%Y-%m-%d %H:%M:%S");
    match turn.role {
        Role::User => format!("[{time}] you: {}", turn.text),
        Role::Assistant => format!("[{time}] {persona}: {}", turn.text),
        Role::Event => format!("[{time}] ✦ {}", turn.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_command("  hello  "), Some(Command::Say("hello".into())));
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn slash_commands_parse_with_arguments() {
        assert_eq!(parse_command("/affect"), Some(Command::Affect { trail: false }));
        assert_eq!(parse_command("/affect history"), Some(Command::Affect { trail: true }));
        assert_eq!(parse_command("/event"), Some(Command::Event { key: None }));
        assert_eq!(
            parse_command("/event night"),
            Some(Command::Event { key: Some("night".into()) })
        );
        assert_eq!(parse_command("/session"), Some(Command::Session(None)));
        assert_eq!(parse_command("/session work"), Some(Command::Session(Some("work".into()))));
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
    }

    #[test]
    fn plan_goes_through_as_a_message() {
        assert_eq!(
            parse_command("/plan bake bread"),
            Some(Command::Say("/plan bake bread".into()))
        );
        assert_eq!(parse_command("/plan"), Some(Command::Unknown("/plan".into())));
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(parse_command("/dance"), Some(Command::Unknown("/dance".into())));
    }

    #[test]
    fn history_lines_name_the_speaker() {
        let sid = SessionId::parse("s").unwrap();
        let turn = Turn::new(sid.clone(), Role::Assistant, "hi");
        assert!(history_line(&turn, "Wren").contains("Wren: hi"));
        let turn = Turn::new(sid, Role::User, "yo");
        assert!(history_line(&turn, "Wren").contains("you: yo"));
    }
}
