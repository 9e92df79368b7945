//! Vibe CLI binary: the "glue" surface named in §6 "CLI surface" —
//! `vibe <file>`, `--log-ai`, `-v/--version`, `upgrade [version]`.
//!
//! The lexer/parser is out of scope for this runtime (spec.md §1); rather
//! than inventing one, `<file>` is a JSON-serialized [`vibe_core::Stmt`]
//! (the `Program` node), the same wire shape `vibe_core::interp::ast`
//! derives `Serialize`/`Deserialize` for expressly so a parser-less driver
//! can load a tree produced offline. Exit code 0 on success, 1 on failure,
//! matching spec.md §6 literally.

mod log_format;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};

use vibe_core::ai::{AiError, AiProvider, AiRequest, AiResponse};
use vibe_core::tools::builtin::register_builtins;
use vibe_core::{run_with_interactions, AiInteraction, RunOptions, Stmt, ToolRegistry};
use vibe_stream::{EnvelopeState, ProtocolEvent};

#[cfg(not(feature = "provider-openai"))]
compile_error!("vibe-cli requires vibe-core's \"provider-openai\" feature");

use vibe_core::ai::openai::OpenAiProvider;

#[derive(Parser, Debug)]
#[command(name = "vibe", version, about = "Run a Vibe program")]
struct Args {
    #[command(subcommand)]
    cmd: Option<Command>,

    /// Path to a Vibe program, serialized as JSON AST (see module docs).
    file: Option<PathBuf>,

    /// Write one NDJSON line per AI request/response/tool-call to
    /// `<file>.log.jsonl` (§6 "Persisted state").
    #[arg(long)]
    log_ai: bool,

    /// Sandbox root for the built-in file tools; defaults to the program
    /// file's parent directory.
    #[arg(long, value_name = "DIR")]
    working_folder: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Check for (or pretend to install) a newer release.
    Upgrade {
        /// Specific version to upgrade to; defaults to "latest".
        version: Option<String>,
    },
}

/// Wraps the configured AI provider so `ask(...)` reads an answer from
/// stdin, the minimal interactive channel the CLI has available — a richer
/// embedding (the DAP bridge, an editor) would instead wire
/// [`AiProvider::ask_user`] to its own UI.
struct CliAiProvider {
    inner: OpenAiProvider,
}

#[async_trait]
impl AiProvider for CliAiProvider {
    async fn invoke(&self, request: &AiRequest) -> Result<AiResponse, AiError> {
        self.inner.invoke(request).await
    }

    async fn ask_user(&self, prompt: &str) -> Result<String, AiError> {
        use std::io::Write;
        print!("{prompt} ");
        std::io::stdout()
            .flush()
            .map_err(|e| AiError::Fatal(e.to_string()))?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| AiError::Fatal(e.to_string()))?;
        Ok(line.trim_end_matches(['\n', '\r']).to_string())
    }
}

/// Appends one NDJSON line per recorded AI/ask exchange, mirroring the
/// teacher's `write_json_line_append` pattern (§6 "Persisted state").
fn write_ai_log(log_path: &std::path::Path, interactions: &[AiInteraction]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let mut envelope = EnvelopeState::new(format!("vibe-{}", std::process::id()));
    for interaction in interactions {
        envelope.enter_frame(interaction.kind);
        let request_event = ProtocolEvent::AiRequest {
            model: interaction.kind.to_string(),
            prompt: interaction.prompt.clone(),
        };
        if let Ok(v) = vibe_stream::to_json(&request_event, &mut envelope) {
            if let Ok(line) = serde_json::to_string(&v) {
                writeln!(file, "{line}")?;
            }
        }
        let response_event = ProtocolEvent::AiResponse {
            message: Some(interaction.response.clone()),
            tool_call_names: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
        };
        if let Ok(v) = vibe_stream::to_json(&response_event, &mut envelope) {
            if let Ok(line) = serde_json::to_string(&v) {
                writeln!(file, "{line}")?;
            }
        }
    }
    let terminated = ProtocolEvent::Terminated;
    if let Ok(v) = vibe_stream::to_json(&terminated, &mut envelope) {
        if let Ok(line) = serde_json::to_string(&v) {
            writeln!(file, "{line}")?;
        }
    }
    Ok(())
}

fn run_upgrade(version: Option<String>) -> ExitCode {
    let target = version.unwrap_or_else(|| "latest".to_string());
    // No package registry is part of this runtime's contract (spec.md §1
    // scopes the installer out); this subcommand exists only to give the
    // CLI surface its named shape, and reports what it would do.
    println!(
        "vibe {} is already the newest version available to this build; \
         no registry is configured to check for {target}.",
        env!("CARGO_PKG_VERSION")
    );
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    vibe_config::load_and_apply("vibe", None::<&std::path::Path>).ok();
    if let Err(e) = logging::init() {
        eprintln!("vibe: failed to initialize logging: {e}");
    }

    let args = Args::parse();

    if let Some(Command::Upgrade { version }) = args.cmd {
        return run_upgrade(version);
    }

    let Some(file) = args.file else {
        eprintln!("vibe: provide a program file, e.g. `vibe program.json`");
        return ExitCode::FAILURE;
    };

    let source = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("vibe: reading {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };
    let program: Stmt = match serde_json::from_str(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("vibe: parsing AST from {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };
    let top_level = match program.kind {
        vibe_core::interp::ast::StmtKind::Program(stmts) => stmts,
        other => vec![Stmt::new(other, program.loc)],
    };

    let working_folder = args.working_folder.unwrap_or_else(|| {
        file.parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    if let Err(e) = std::fs::create_dir_all(&working_folder) {
        eprintln!("vibe: working folder {}: {e}", working_folder.display());
        return ExitCode::FAILURE;
    }

    let registry = ToolRegistry::new();
    register_builtins(&registry, Arc::new(working_folder)).await;

    let ai = CliAiProvider {
        inner: OpenAiProvider::default(),
    };
    let host = vibe_core::host::UnconfiguredHostEvaluator;
    let options = RunOptions::default();

    let (result, interactions) =
        run_with_interactions(top_level, options, &ai, &host, &registry).await;

    if args.log_ai {
        let log_path = file.with_extension("log.jsonl");
        if let Err(e) = write_ai_log(&log_path, &interactions) {
            eprintln!("vibe: writing --log-ai output to {}: {e}", log_path.display());
        }
    }

    match result {
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("vibe: {e}");
            ExitCode::FAILURE
        }
    }
}
