//! Executing an assembled bundle.
//!
//! The payload runs inside a [`ScriptHost`]. Loading it must publish the
//! registry object; the host reports its shape and hands back a
//! [`BundleHandle`] through which `init`, `ready` and handlers are invoked.
//! The resulting [`MelkerRegistry`] is owned by the caller.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdout};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use url::Url;

use crate::bundle::AssembledMelker;
use crate::bundler::{ScratchDir, DENO_ENV};
use crate::generator::{CONTEXT_MEMBERS, ENTRY_FILENAME, REGISTRY_GLOBAL};
use crate::translate::{ErrorTranslator, TranslatedError};
use crate::utils::{base_url, escape_js_string, source_dirname};

pub const PAYLOAD_FILENAME: &str = "melker_bundle.js";

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// What the payload sees as `globalThis.$melker` and `globalThis.argv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub argv: Vec<String>,
    pub url: String,
    pub dirname: String,
    /// Module whose default export is the host's context object. Without
    /// one the script host provides a minimal stand-in.
    pub capabilities: Option<String>,
}

impl ExecutionContext {
    pub fn for_source(source_id: &str, argv: Vec<String>) -> Self {
        let url = base_url(source_id)
            .map(|u| u.to_string())
            .unwrap_or_else(|| source_id.to_string());
        let dirname = base_url(source_id)
            .and_then(|u| u.to_file_path().ok())
            .and_then(|p| p.parent().map(|d| d.display().to_string()))
            .unwrap_or_else(|| source_dirname(source_id));
        Self {
            argv,
            url,
            dirname,
            capabilities: None,
        }
    }

    pub fn with_capabilities(mut self, module: impl Into<String>) -> Self {
        self.capabilities = Some(module.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Host capability
// ---------------------------------------------------------------------------

/// Members the payload published on the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryShape {
    pub init: bool,
    pub ready: bool,
    pub handlers: Vec<String>,
}

/// An exception raised by script code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("script host unavailable: {0}")]
    Unavailable(String),

    #[error("{}", .0.message)]
    Script(ScriptFailure),

    #[error("script host protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub struct LoadedBundle<H> {
    pub handle: H,
    /// `None` when the payload did not publish the registry.
    pub registry: Option<RegistryShape>,
}

/// A loaded payload.
pub trait BundleHandle: Send {
    /// Call a registry member with an optional event and await it.
    fn invoke(
        &mut self,
        member: &str,
        event: Option<&Value>,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), HostError>> + Send;
}

/// Loads bundled payloads and exposes their registry.
pub trait ScriptHost: Sync {
    type Handle: BundleHandle;

    fn load(
        &self,
        payload: &Path,
        context: &ExecutionContext,
    ) -> impl Future<Output = Result<LoadedBundle<Self::Handle>, HostError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A script failure with its translated form.
#[derive(Debug, Clone)]
pub struct TranslatedFailure {
    pub translated: TranslatedError,
    pub raw: String,
}

impl TranslatedFailure {
    fn new(translator: &ErrorTranslator, failure: ScriptFailure) -> Self {
        let raw = if failure.stack.trim().is_empty() {
            failure.message
        } else {
            failure.stack
        };
        Self {
            translated: translator.translate(&raw),
            raw,
        }
    }
}

impl fmt::Display for TranslatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.translated.format())?;
        write!(f, "\nRaw error:\n{}", self.raw.trim_end())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("bundle failed to load: {}", .0.translated.message)]
    Load(TranslatedFailure),

    #[error("init failed: {}", .0.translated.message)]
    Init(TranslatedFailure),

    #[error("ready failed: {}", .0.translated.message)]
    Ready(TranslatedFailure),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    pub fn failure(&self) -> Option<&TranslatedFailure> {
        match self {
            RuntimeError::Load(f) | RuntimeError::Init(f) | RuntimeError::Ready(f) => Some(f),
            _ => None,
        }
    }

    /// Translated and raw detail for a fatal exit.
    pub fn report(&self) -> String {
        match self {
            RuntimeError::Load(f) => format!("Error while loading the app:\n{f}"),
            RuntimeError::Init(f) => format!("Error in async init:\n{f}"),
            RuntimeError::Ready(f) => format!("Error in async ready:\n{f}"),
            RuntimeError::MalformedBundle(detail) => format!(
                "Malformed bundle: {detail}\nThe payload must publish globalThis.{REGISTRY_GLOBAL}."
            ),
            other => other.to_string(),
        }
    }
}

/// A handler failure. Never fatal.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler `{0}` in the registry")]
    Unknown(String),

    #[error("handler `{id}` failed: {}", .failure.translated.message)]
    Failed {
        id: String,
        /// `defined at <file>:<line>`, when known.
        location: Option<String>,
        failure: TranslatedFailure,
    },

    #[error(transparent)]
    Host(#[from] HostError),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct MelkerRegistry<H: BundleHandle> {
    handle: H,
    shape: RegistryShape,
    translator: ErrorTranslator,
    ready_called: bool,
    // Held for the registry's lifetime; removed on drop.
    _payload_dir: Option<ScratchDir>,
    _artifacts: Option<ScratchDir>,
}

impl<H: BundleHandle> MelkerRegistry<H> {
    pub fn shape(&self) -> &RegistryShape {
        &self.shape
    }

    pub fn has_handler(&self, id: &str) -> bool {
        self.shape.handlers.iter().any(|h| h == id)
    }

    pub fn translator(&self) -> &ErrorTranslator {
        &self.translator
    }

    /// Run `ready` once. Returns whether it was invoked.
    pub async fn call_ready(&mut self) -> Result<bool, RuntimeError> {
        if self.ready_called {
            return Ok(false);
        }
        self.ready_called = true;
        if !self.shape.ready {
            return Ok(false);
        }
        match self.handle.invoke("ready", None).await {
            Ok(()) => Ok(true),
            Err(HostError::Script(failure)) => Err(RuntimeError::Ready(TranslatedFailure::new(
                &self.translator,
                failure,
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Invoke a handler. Failures are translated and returned for display.
    pub async fn call_handler(&mut self, id: &str, event: Option<&Value>) -> Result<(), HandlerError> {
        if !self.has_handler(id) {
            return Err(HandlerError::Unknown(id.to_string()));
        }
        match self.handle.invoke(id, event).await {
            Ok(()) => Ok(()),
            Err(HostError::Script(failure)) => {
                let failure = TranslatedFailure::new(&self.translator, failure);
                let location = self.translator.handler_location(id);
                warn!(handler = %id, location = ?location, "handler failed: {}", failure.translated.message);
                Err(HandlerError::Failed {
                    id: id.to_string(),
                    location,
                    failure,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(mut self) -> Result<(), HostError> {
        self.handle.close().await
    }
}

/// Load `assembled` into `host`, check the registry and await `init`.
pub async fn execute_bundle<S: ScriptHost>(
    mut assembled: AssembledMelker,
    host: &S,
    context: &ExecutionContext,
) -> Result<MelkerRegistry<S::Handle>, RuntimeError> {
    let artifacts = assembled.artifacts.take();

    // Unbundled payloads import their modules by relative path.
    let (payload_dir, payload, payload_name) = match &artifacts {
        Some(dir) => (None, dir.path().join(ENTRY_FILENAME), ENTRY_FILENAME),
        None => {
            let dir = ScratchDir::new()?;
            let payload = dir.path().join(PAYLOAD_FILENAME);
            (Some(dir), payload, PAYLOAD_FILENAME)
        }
    };
    let translator = assembled.translator().with_payload_file(payload_name);
    tokio::fs::write(&payload, &assembled.bundled_code).await?;
    debug!(payload = %payload.display(), "loading bundle");

    let loaded = match host.load(&payload, context).await {
        Ok(loaded) => loaded,
        Err(HostError::Script(failure)) => {
            return Err(RuntimeError::Load(TranslatedFailure::new(&translator, failure)))
        }
        Err(e) => return Err(e.into()),
    };
    let Some(shape) = loaded.registry else {
        return Err(RuntimeError::MalformedBundle(format!(
            "{} did not publish globalThis.{REGISTRY_GLOBAL}",
            assembled.source_id
        )));
    };

    let mut registry = MelkerRegistry {
        handle: loaded.handle,
        shape,
        translator,
        ready_called: false,
        _payload_dir: payload_dir,
        _artifacts: artifacts,
    };

    if registry.shape.init {
        match registry.handle.invoke("init", None).await {
            Ok(()) => {}
            Err(HostError::Script(failure)) => {
                return Err(RuntimeError::Init(TranslatedFailure::new(
                    &registry.translator,
                    failure,
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        source = %assembled.source_id,
        handlers = registry.shape.handlers.len(),
        "bundle loaded"
    );
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Fatal exit
// ---------------------------------------------------------------------------

/// Puts the terminal back into a usable state before printing.
pub trait DisplayRestore {
    fn restore(&mut self);
}

/// For hosts that never took over the display.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDisplay;

impl DisplayRestore for NoDisplay {
    fn restore(&mut self) {}
}

/// Restore the display, print `report` and exit with status 1.
pub fn exit_fatal(display: &mut dyn DisplayRestore, report: &dyn fmt::Display) -> ! {
    display.restore();
    eprintln!("{report}");
    std::process::exit(1)
}

// ---------------------------------------------------------------------------
// Deno host
// ---------------------------------------------------------------------------

const MESSAGE_MARKER: &str = "\u{1}melker ";
const DRIVER_FILENAME: &str = "_melker_driver.js";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HostMessage {
    Loaded(RegistryShape),
    Malformed,
    Done,
    Failed(ScriptFailure),
    Context { member: String, args: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HostCommand<'a> {
    Invoke { member: &'a str, event: Option<&'a Value> },
    Close,
}

/// Runs payloads in a `deno run` subprocess.
#[derive(Debug, Clone)]
pub struct DenoHost {
    program: PathBuf,
    permissions: Vec<String>,
}

impl DenoHost {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            permissions: vec!["--allow-all".to_string()],
        }
    }

    /// `MELKER_DENO`, else `deno` from `PATH`.
    pub fn from_env() -> Self {
        match std::env::var_os(DENO_ENV) {
            Some(program) if !program.is_empty() => Self::new(program),
            _ => Self::new("deno"),
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }
}

impl Default for DenoHost {
    fn default() -> Self {
        Self::from_env()
    }
}

/// A loaded payload. Lines the app prints that are not protocol messages
/// are relayed to our stdout.
pub struct DenoHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    app_output: Stdout,
}

impl DenoHandle {
    async fn next_message(&mut self) -> Result<HostMessage, HostError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                let status = self.child.wait().await?;
                return Err(HostError::Protocol(format!("script host exited ({status})")));
            };
            let Some(json) = line.strip_prefix(MESSAGE_MARKER) else {
                relay_app_output(&mut self.app_output, &line).await?;
                continue;
            };
            match serde_json::from_str(json) {
                Ok(HostMessage::Context { member, args }) => {
                    debug!(%member, %args, "context call");
                }
                Ok(message) => return Ok(message),
                Err(e) => return Err(HostError::Protocol(format!("bad message {json:?}: {e}"))),
            }
        }
    }

    async fn send(&mut self, command: &HostCommand<'_>) -> Result<(), HostError> {
        let mut line = serde_json::to_string(command)
            .map_err(|e| HostError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn relay_app_output<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

impl BundleHandle for DenoHandle {
    fn invoke(
        &mut self,
        member: &str,
        event: Option<&Value>,
    ) -> impl Future<Output = Result<(), HostError>> + Send {
        async move {
            self.send(&HostCommand::Invoke { member, event }).await?;
            match self.next_message().await? {
                HostMessage::Done => Ok(()),
                HostMessage::Failed(failure) => Err(HostError::Script(failure)),
                other => Err(HostError::Protocol(format!("unexpected reply {other:?}"))),
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = Result<(), HostError>> + Send {
        async move {
            // The host may already be gone.
            let _ = self.send(&HostCommand::Close).await;
            self.child.wait().await?;
            Ok(())
        }
    }
}

impl ScriptHost for DenoHost {
    type Handle = DenoHandle;

    fn load(
        &self,
        payload: &Path,
        context: &ExecutionContext,
    ) -> impl Future<Output = Result<LoadedBundle<DenoHandle>, HostError>> + Send {
        let program = self.program.clone();
        let permissions = self.permissions.clone();
        let payload = payload.to_path_buf();
        let context = context.clone();

        async move {
            let payload_url = Url::from_file_path(&payload)
                .map_err(|_| HostError::Protocol(format!("not an absolute path: {}", payload.display())))?;
            let driver = payload.with_file_name(DRIVER_FILENAME);
            tokio::fs::write(&driver, driver_script()).await?;
            let context_json = serde_json::to_string(&context)
                .map_err(|e| HostError::Protocol(e.to_string()))?;

            let mut child = Command::new(&program)
                .arg("run")
                .arg("--quiet")
                .args(&permissions)
                .arg(&driver)
                .arg(payload_url.as_str())
                .arg(&context_json)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| HostError::Unavailable(format!("{}: {e}", program.display())))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| HostError::Protocol("stdin not captured".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| HostError::Protocol("stdout not captured".into()))?;
            let mut handle = DenoHandle {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                app_output: tokio::io::stdout(),
            };

            match handle.next_message().await? {
                HostMessage::Loaded(shape) => Ok(LoadedBundle {
                    handle,
                    registry: Some(shape),
                }),
                HostMessage::Malformed => Ok(LoadedBundle {
                    handle,
                    registry: None,
                }),
                HostMessage::Failed(failure) => Err(HostError::Script(failure)),
                other => Err(HostError::Protocol(format!("unexpected reply {other:?}"))),
            }
        }
    }
}

/// Fallback `$melker` members, built from [`CONTEXT_MEMBERS`].
fn fallback_context() -> String {
    let mut members = Vec::new();
    for &member in CONTEXT_MEMBERS {
        let value = match member {
            "exports" => "{}".to_string(),
            "url" | "dirname" => format!("context.{member}"),
            "logger" => "{ debug: console.error, info: console.error, warn: console.error, error: console.error }".to_string(),
            "exit" | "quit" => "() => Deno.exit(0)".to_string(),
            "getElementById" => "() => undefined".to_string(),
            "confirm" => "() => false".to_string(),
            "prompt" => "() => null".to_string(),
            other => format!(
                "(...args) => send({{ type: \"context\", member: \"{}\", args }})",
                escape_js_string(other)
            ),
        };
        members.push(format!("    {member}: {value},"));
    }
    members.join("\n")
}

fn driver_script() -> String {
    format!(
        r#"const MARKER = "\u0001melker ";
const send = (message) => console.log(MARKER + JSON.stringify(message));
const failure = (e) => ({{ message: String(e?.message ?? e), stack: String(e?.stack ?? "") }});
const [payloadUrl, contextJson] = Deno.args;
const context = JSON.parse(contextJson);

let $melker;
if (context.capabilities) {{
  const mod = await import(context.capabilities);
  $melker = mod.default ?? mod.$melker;
}} else {{
  $melker = {{
{members}
  }};
}}
$melker.url ??= context.url;
$melker.dirname ??= context.dirname;
$melker.exports ??= {{}};
globalThis.$melker = $melker;
globalThis.argv = context.argv;

try {{
  await import(payloadUrl);
}} catch (e) {{
  send({{ type: "failed", ...failure(e) }});
  Deno.exit(0);
}}

const registry = globalThis.{registry};
if (!registry || typeof registry !== "object") {{
  send({{ type: "malformed" }});
}} else {{
  send({{
    type: "loaded",
    init: typeof registry.init === "function",
    ready: typeof registry.ready === "function",
    handlers: Object.keys(registry).filter((k) => k !== "init" && k !== "ready" && typeof registry[k] === "function"),
  }});
}}

const handle = async (command) => {{
  if (command.type === "close") Deno.exit(0);
  const fn = registry?.[command.member];
  if (typeof fn !== "function") {{
    send({{ type: "failed", message: `No registry member ${{command.member}}`, stack: "" }});
    return;
  }}
  try {{
    await fn(command.event ?? undefined);
    send({{ type: "done" }});
  }} catch (e) {{
    send({{ type: "failed", ...failure(e) }});
  }}
}};

let buffer = "";
for await (const chunk of Deno.stdin.readable.pipeThrough(new TextDecoderStream())) {{
  buffer += chunk;
  let newline;
  while ((newline = buffer.indexOf("\n")) >= 0) {{
    const line = buffer.slice(0, newline);
    buffer = buffer.slice(newline + 1);
    if (line.trim()) await handle(JSON.parse(line));
  }}
}}
"#,
        members = fallback_context(),
        registry = REGISTRY_GLOBAL,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{LineMap, LineMapping};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Script {
        registry: Option<RegistryShape>,
        load_failure: Option<ScriptFailure>,
        failing: Vec<(String, ScriptFailure)>,
    }

    #[derive(Clone, Default)]
    struct FakeHost {
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
        payloads: Arc<Mutex<Vec<(PathBuf, String)>>>,
    }

    struct FakeHandle {
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl BundleHandle for FakeHandle {
        fn invoke(
            &mut self,
            member: &str,
            event: Option<&Value>,
        ) -> impl Future<Output = Result<(), HostError>> + Send {
            let call = match event {
                Some(event) => format!("{member}({event})"),
                None => member.to_string(),
            };
            self.calls.lock().unwrap().push(call);
            let failure = self
                .script
                .failing
                .iter()
                .find(|(m, _)| m == member)
                .map(|(_, f)| f.clone());
            async move {
                match failure {
                    Some(f) => Err(HostError::Script(f)),
                    None => Ok(()),
                }
            }
        }

        fn close(&mut self) -> impl Future<Output = Result<(), HostError>> + Send {
            async { Ok(()) }
        }
    }

    impl ScriptHost for FakeHost {
        type Handle = FakeHandle;

        fn load(
            &self,
            payload: &Path,
            _context: &ExecutionContext,
        ) -> impl Future<Output = Result<LoadedBundle<FakeHandle>, HostError>> + Send {
            let code = std::fs::read_to_string(payload).unwrap();
            self.payloads.lock().unwrap().push((payload.to_path_buf(), code));
            let script = self.script.clone();
            let calls = self.calls.clone();
            async move {
                if let Some(f) = script.load_failure.clone() {
                    return Err(HostError::Script(f));
                }
                Ok(LoadedBundle {
                    registry: script.registry.clone(),
                    handle: FakeHandle { script, calls },
                })
            }
        }
    }

    fn assembled() -> AssembledMelker {
        let mut line_map = LineMap::new();
        line_map.insert(20, LineMapping {
            original_line: 6,
            source_id: "__h0".into(),
            description: "onClick on <button>".into(),
        });
        line_map.insert(12, LineMapping {
            original_line: 3,
            source_id: "init0".into(),
            description: "init script".into(),
        });
        AssembledMelker {
            template: "<button onClick=\"__melker.__h0(event)\"/>".into(),
            bundled_code: "globalThis.__melker = {};\n".into(),
            line_map,
            source_map: None,
            script_meta: vec![],
            original_content: "line1\nline2\ninit line\nline4\nline5\n  onClick=\"boom()\"\n".into(),
            source_id: "/apps/demo.melker".into(),
            artifacts: None,
            metadata: None,
        }
    }

    fn shape(init: bool, ready: bool, handlers: &[&str]) -> RegistryShape {
        RegistryShape {
            init,
            ready,
            handlers: handlers.iter().map(|h| h.to_string()).collect(),
        }
    }

    fn failure(stack: &str) -> ScriptFailure {
        ScriptFailure {
            message: stack.lines().next().unwrap_or_default().to_string(),
            stack: stack.into(),
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::for_source("/apps/demo.melker", vec!["--flag".into()])
    }

    #[tokio::test]
    async fn init_is_awaited_during_execute() {
        let host = FakeHost {
            script: Script {
                registry: Some(shape(true, true, &["__h0"])),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = execute_bundle(assembled(), &host, &context()).await.unwrap();
        assert_eq!(*host.calls.lock().unwrap(), vec!["init".to_string()]);
        assert!(registry.has_handler("__h0"));

        let payloads = host.payloads.lock().unwrap();
        assert_eq!(payloads[0].1, "globalThis.__melker = {};\n");
        assert!(payloads[0].0.ends_with(PAYLOAD_FILENAME));
    }

    #[tokio::test]
    async fn missing_registry_is_malformed() {
        let host = FakeHost::default();
        let err = execute_bundle(assembled(), &host, &context()).await.err().unwrap();
        assert!(matches!(err, RuntimeError::MalformedBundle(_)));
        assert!(err.report().contains("globalThis.__melker"));
    }

    #[tokio::test]
    async fn load_failure_is_translated() {
        let host = FakeHost {
            script: Script {
                load_failure: Some(failure("Error: top-level\n    at file:///t/melker_bundle.js:20:1")),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = execute_bundle(assembled(), &host, &context()).await.err().unwrap();
        let f = err.failure().unwrap();
        assert_eq!(f.translated.frames[0].line, 6);
        let report = err.report();
        assert!(report.starts_with("Error while loading the app:\nError: top-level"));
        assert!(report.contains("demo.melker:6"));
        assert!(report.contains("Raw error:\nError: top-level\n    at file:///t/melker_bundle.js:20:1"));
    }

    #[tokio::test]
    async fn init_failure_is_fatal_error() {
        let host = FakeHost {
            script: Script {
                registry: Some(shape(true, false, &[])),
                failing: vec![("init".into(), failure("Error: nope\n    at __init_0 (file:///t/melker_bundle.js:12:3)"))],
                ..Default::default()
            },
            ..Default::default()
        };
        let err = execute_bundle(assembled(), &host, &context()).await.err().unwrap();
        assert!(matches!(err, RuntimeError::Init(_)));
        assert!(err.report().contains("at async init (/apps/demo.melker:3)"));
    }

    #[tokio::test]
    async fn ready_runs_at_most_once() {
        let host = FakeHost {
            script: Script {
                registry: Some(shape(false, true, &[])),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut registry = execute_bundle(assembled(), &host, &context()).await.unwrap();
        assert!(registry.call_ready().await.unwrap());
        assert!(!registry.call_ready().await.unwrap());
        assert_eq!(*host.calls.lock().unwrap(), vec!["ready".to_string()]);
    }

    #[tokio::test]
    async fn handler_failure_is_not_fatal() {
        let host = FakeHost {
            script: Script {
                registry: Some(shape(false, false, &["__h0"])),
                failing: vec![(
                    "__h0".into(),
                    failure(
                        "ReferenceError: boom is not defined\n    at __h0 (file:///t/melker_bundle.js:20:5)\n    at handle (file:///t/_melker_driver.js:63:11)",
                    ),
                )],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut registry = execute_bundle(assembled(), &host, &context()).await.unwrap();

        let event = serde_json::json!({ "type": "click" });
        match registry.call_handler("__h0", Some(&event)).await {
            Err(HandlerError::Failed { id, location, failure }) => {
                assert_eq!(id, "__h0");
                assert_eq!(location.as_deref(), Some("defined at /apps/demo.melker:6"));
                assert_eq!(failure.translated.frames[0].function_name, "event handler");
                assert_eq!(failure.translated.known_frames().count(), 1);
                assert!(!failure.translated.format().contains("at handle ("));
                assert_eq!(
                    failure.translated.frames[0].source_line.as_deref(),
                    Some("  onClick=\"boom()\"")
                );
            }
            other => panic!("expected handler failure, got {other:?}"),
        }

        // The registry stays usable.
        assert!(matches!(
            registry.call_handler("__h9", None).await,
            Err(HandlerError::Unknown(_))
        ));
        assert_eq!(
            *host.calls.lock().unwrap(),
            vec![r#"__h0({"type":"click"})"#.to_string()]
        );
    }

    #[tokio::test]
    async fn payload_dir_is_removed_with_registry() {
        let host = FakeHost {
            script: Script {
                registry: Some(shape(false, false, &[])),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = execute_bundle(assembled(), &host, &context()).await.unwrap();
        let payload = host.payloads.lock().unwrap()[0].0.clone();
        assert!(payload.exists());
        registry.close().await.unwrap();
        assert!(!payload.exists());
    }

    #[test]
    fn context_for_plain_path() {
        let ctx = context();
        assert_eq!(ctx.url, "file:///apps/demo.melker");
        assert_eq!(ctx.dirname, "/apps");
        assert_eq!(ctx.argv, vec!["--flag".to_string()]);
        assert_eq!(ctx.capabilities, None);
    }

    #[test]
    fn driver_covers_context_members() {
        let driver = driver_script();
        for member in CONTEXT_MEMBERS {
            assert!(driver.contains(&format!("    {member}: ")), "missing {member}");
        }
        assert!(driver.contains("globalThis.__melker;"));
        assert!(driver.contains(r#"const MARKER = "\u0001melker ";"#));
    }

    #[test]
    fn host_messages_parse() {
        let loaded: HostMessage =
            serde_json::from_str(r#"{"type":"loaded","init":true,"ready":false,"handlers":["__h0"]}"#).unwrap();
        assert!(matches!(loaded, HostMessage::Loaded(RegistryShape { init: true, .. })));
        let failed: HostMessage =
            serde_json::from_str(r#"{"type":"failed","message":"boom"}"#).unwrap();
        assert!(matches!(failed, HostMessage::Failed(ScriptFailure { ref stack, .. }) if stack.is_empty()));
        let command = serde_json::to_string(&HostCommand::Invoke { member: "__h0", event: None }).unwrap();
        assert_eq!(command, r#"{"type":"invoke","member":"__h0","event":null}"#);
    }

    #[tokio::test]
    async fn app_output_is_relayed_line_by_line() {
        let mut out: Vec<u8> = Vec::new();
        relay_app_output(&mut out, "count: 1").await.unwrap();
        relay_app_output(&mut out, "").await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "count: 1\n\n");
    }

    #[tokio::test]
    async fn missing_deno_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join(PAYLOAD_FILENAME);
        std::fs::write(&payload, "").unwrap();
        let host = DenoHost::new("/nonexistent/melker-test/deno");
        let err = host.load(&payload, &context()).await.err().unwrap();
        assert!(matches!(err, HostError::Unavailable(_)));
    }
}
