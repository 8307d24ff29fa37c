//! `BrowserDriver` backed by a long-lived Node + Playwright process.
//!
//! The Rust side writes one JSON request per line to the child's stdin and reads one JSON reply
//! per line from its stdout. Requests carry an id; replies for ids we already gave up on (after a
//! timeout) are skipped.

use fipibank_core::{BrowserDriver, Error, FrameInfo, FrameRef, Locator, Result};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Slack on top of the in-browser timeout before the Rust side gives up on a reply.
const REPLY_GRACE: Duration = Duration::from_secs(5);

const DRIVER_JS: &str = r#"
const readline = require('readline');

function send(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }
function fail(id, code, message) { send({ id, ok: false, error: { code, message } }); }

async function main() {
  const opts = JSON.parse(process.argv[2] || '{}');
  let pw;
  try { pw = require('playwright'); } catch (e) {
    return fail(0, 'not_configured',
      'Playwright is not installed for Node.js. Install it with `npm i -g playwright` and `npx playwright install chromium`.');
  }
  const browser = await pw.chromium.launch({
    headless: opts.headless !== false,
    args: ['--disable-blink-features=AutomationControlled'],
  });
  const context = await browser.newContext({
    userAgent: opts.userAgent || undefined,
    locale: opts.locale || 'ru-RU',
    extraHTTPHeaders: opts.acceptLanguage ? { 'Accept-Language': opts.acceptLanguage } : {},
  });
  const page = await context.newPage();

  function frameOf(ref) {
    if (ref === null || ref === undefined) return page.mainFrame();
    const f = page.frames().find((f) => f.name() === ref || f.url().includes(ref));
    if (!f) { const e = new Error('no frame matching ' + ref); e.code = 'no_frame'; throw e; }
    return f;
  }
  function locate(frame, loc) {
    if (loc.kind === 'css') return frame.locator(loc.value).first();
    return frame.getByText(new RegExp(loc.value, 'i')).first();
  }

  const ops = {
    async goto(f, r) { await f.goto(r.url, { waitUntil: 'domcontentloaded', timeout: r.timeoutMs }); return null; },
    async wait_for_selector(f, r) { await f.waitForSelector(r.selector, { timeout: r.timeoutMs }); return null; },
    async frames() { return page.frames().map((f) => ({ name: f.name(), url: f.url() })); },
    async click(f, r) {
      const el = locate(f, r.locator);
      if ((await el.count()) === 0) return false;
      await el.click({ timeout: r.timeoutMs });
      return true;
    },
    async fill_near_label(f, r) {
      const label = locate(f, r.label);
      if ((await label.count()) === 0) return false;
      const field = label.locator('xpath=following::*[self::select or self::input][1]').first();
      if ((await field.count()) === 0) return false;
      const tag = await field.evaluate((el) => el.tagName.toLowerCase());
      if (tag === 'select') await field.selectOption(String(r.value), { timeout: r.timeoutMs });
      else await field.fill(String(r.value), { timeout: r.timeoutMs });
      return true;
    },
    async wait_load(f, r) { await f.waitForLoadState('networkidle', { timeout: r.timeoutMs }); return null; },
    async content(f) { return await f.content(); },
    async url(f) { return f.url(); },
  };

  send({ id: 0, ok: true, result: 'ready' });
  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    let req;
    try { req = JSON.parse(line); } catch (e) { fail(-1, 'invalid_request', String(e)); continue; }
    if (req.op === 'close') break;
    const op = ops[req.op];
    if (!op) { fail(req.id, 'not_supported', 'unknown op ' + req.op); continue; }
    try {
      const result = await op(frameOf(req.frame), req);
      send({ id: req.id, ok: true, result });
    } catch (e) {
      const code = e && e.name === 'TimeoutError' ? 'timeout' : (e && e.code) || 'browser';
      fail(req.id, code, String(e && e.message ? e.message : e));
    }
  }
  try { await browser.close(); } catch (_) {}
  process.exit(0);
}

main().catch((e) => { fail(0, 'browser', String(e && e.message ? e.message : e)); process.exit(1); });
"#;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub locale: String,
    pub accept_language: String,
    /// `FIPIBANK_NODE`, else `node` from PATH.
    pub node_bin: String,
    pub launch_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            locale: "ru-RU".to_string(),
            accept_language: "ru-RU,ru;q=0.9,en;q=0.8".to_string(),
            node_bin: crate::env("FIPIBANK_NODE").unwrap_or_else(|| "node".to_string()),
            launch_timeout: Duration::from_millis(crate::env_u64(
                "FIPIBANK_BROWSER_LAUNCH_TIMEOUT_MS",
                60_000,
            )),
        }
    }
}

/// Global node_modules roots that may hold `playwright`, for setting `NODE_PATH`.
async fn detect_node_path_for_playwright() -> Option<String> {
    if let Some(v) = crate::env("FIPIBANK_NODE_PATH") {
        return Some(v);
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    let has_playwright = |root: &str| std::path::Path::new(root.trim()).join("playwright").is_dir();
    if existing.split(':').any(|p| !p.trim().is_empty() && has_playwright(p)) {
        return None;
    }

    let npm_root = tokio::process::Command::new("npm")
        .args(["root", "-g"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty());
    let mut candidates: Vec<String> = npm_root.into_iter().collect();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        candidates.push(home.join(".npm-global/lib/node_modules").to_string_lossy().into_owned());
    }
    candidates.extend(
        ["/opt/homebrew/lib/node_modules", "/usr/local/lib/node_modules", "/usr/lib/node_modules"]
            .map(String::from),
    );

    let found = candidates.into_iter().find(|c| has_playwright(c))?;
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

fn frame_value(frame: &FrameRef) -> Value {
    match frame {
        FrameRef::Main => Value::Null,
        FrameRef::Named(n) => Value::from(n.as_str()),
    }
}

fn locator_value(loc: &Locator) -> Value {
    match loc {
        Locator::Text(re) => json!({ "kind": "text", "value": re }),
        Locator::Css(sel) => json!({ "kind": "css", "value": sel }),
    }
}

fn error_from_reply(v: &Value) -> Error {
    let code = v.pointer("/error/code").and_then(Value::as_str).unwrap_or("browser");
    let message = v
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("browser driver failed")
        .to_string();
    match code {
        "timeout" => Error::Timeout(message),
        "not_configured" => Error::NotConfigured(message),
        "not_supported" => Error::NotSupported(message),
        _ => Error::Browser(message),
    }
}

/// `None` when the line is not the reply to `id` (stale or garbage); the caller keeps reading.
fn parse_reply(line: &str, id: u64) -> Option<Result<Value>> {
    let v: Value = serde_json::from_str(line.trim()).ok()?;
    if v.get("id").and_then(Value::as_u64) != Some(id) {
        return None;
    }
    if v.get("ok").and_then(Value::as_bool) == Some(true) {
        Some(Ok(v.get("result").cloned().unwrap_or(Value::Null)))
    } else {
        Some(Err(error_from_reply(&v)))
    }
}

struct Io {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Io {
    async fn read_reply(&mut self, id: u64) -> Result<Value> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| Error::Browser(format!("driver read failed: {e}")))?
                .ok_or_else(|| Error::Browser("browser driver exited".to_string()))?;
            match parse_reply(&line, id) {
                Some(r) => return r,
                None => debug!(line = %line.chars().take(200).collect::<String>(), "skipping driver output"),
            }
        }
    }
}

pub struct PlaywrightSession {
    io: Mutex<Io>,
    next_id: AtomicU64,
}

impl PlaywrightSession {
    /// Spawn Node, launch Chromium and wait for the driver to report ready.
    pub async fn launch(opts: &LaunchOptions) -> Result<Self> {
        let launch_json = json!({
            "headless": opts.headless,
            "userAgent": opts.user_agent,
            "locale": opts.locale,
            "acceptLanguage": opts.accept_language,
        })
        .to_string();

        let mut cmd = tokio::process::Command::new(&opts.node_bin);
        if let Some(node_path) = detect_node_path_for_playwright().await {
            cmd.env("NODE_PATH", node_path);
        }
        let mut child = cmd
            .arg("-e")
            .arg(DRIVER_JS)
            .arg(launch_json)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "browser session requires Node.js ({}) and the Playwright npm package: {e}",
                    opts.node_bin
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Browser("missing driver stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Browser("missing driver stdout pipe".to_string()))?;
        let mut io = Io {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match tokio::time::timeout(opts.launch_timeout, io.read_reply(0)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = io.child.kill().await;
                return Err(Error::Timeout(format!(
                    "browser launch took longer than {:?}",
                    opts.launch_timeout
                )));
            }
        }
        info!(headless = opts.headless, "browser session ready");
        Ok(Self {
            io: Mutex::new(io),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, op: &str, frame: &FrameRef, mut args: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Value::Object(m) = &mut args {
            m.insert("id".into(), Value::from(id));
            m.insert("op".into(), Value::from(op));
            m.insert("frame".into(), frame_value(frame));
            m.insert("timeoutMs".into(), Value::from(timeout.as_millis() as u64));
        }
        let mut line = args.to_string();
        line.push('\n');

        let mut io = self.io.lock().await;
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Browser(format!("driver write failed: {e}")))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| Error::Browser(format!("driver write failed: {e}")))?;
        match tokio::time::timeout(timeout + REPLY_GRACE, io.read_reply(id)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!("{op} took longer than {timeout:?}"))),
        }
    }

    /// Ask the driver to close the browser; kill it if it does not exit promptly.
    pub async fn close(self) {
        let mut io = self.io.into_inner();
        let _ = io.stdin.write_all(b"{\"op\":\"close\"}\n").await;
        let _ = io.stdin.flush().await;
        if tokio::time::timeout(Duration::from_secs(10), io.child.wait())
            .await
            .is_err()
        {
            warn!("browser driver did not exit; killing it");
            let _ = io.child.kill().await;
        }
    }
}

fn as_bool(v: Value, op: &str) -> Result<bool> {
    v.as_bool()
        .ok_or_else(|| Error::Browser(format!("{op}: expected a boolean reply")))
}

fn as_string(v: Value, op: &str) -> Result<String> {
    match v {
        Value::String(s) => Ok(s),
        _ => Err(Error::Browser(format!("{op}: expected a string reply"))),
    }
}

/// Used for calls that take no explicit timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
impl BrowserDriver for PlaywrightSession {
    async fn navigate(&self, frame: &FrameRef, url: &str, timeout: Duration) -> Result<()> {
        self.call("goto", frame, json!({ "url": url }), timeout).await?;
        Ok(())
    }

    async fn wait_for_selector(&self, frame: &FrameRef, selector: &str, timeout: Duration) -> Result<()> {
        self.call("wait_for_selector", frame, json!({ "selector": selector }), timeout)
            .await?;
        Ok(())
    }

    async fn frames(&self) -> Result<Vec<FrameInfo>> {
        let v = self.call("frames", &FrameRef::Main, json!({}), READ_TIMEOUT).await?;
        serde_json::from_value(v).map_err(|e| Error::Browser(format!("frames: {e}")))
    }

    async fn click(&self, frame: &FrameRef, locator: &Locator, timeout: Duration) -> Result<bool> {
        let v = self
            .call("click", frame, json!({ "locator": locator_value(locator) }), timeout)
            .await?;
        as_bool(v, "click")
    }

    async fn fill_near_label(
        &self,
        frame: &FrameRef,
        label: &Locator,
        value: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let args = json!({ "label": locator_value(label), "value": value });
        let v = self.call("fill_near_label", frame, args, timeout).await?;
        as_bool(v, "fill_near_label")
    }

    async fn wait_for_load(&self, frame: &FrameRef, timeout: Duration) -> Result<()> {
        self.call("wait_load", frame, json!({}), timeout).await?;
        Ok(())
    }

    async fn content(&self, frame: &FrameRef) -> Result<String> {
        let v = self.call("content", frame, json!({}), READ_TIMEOUT).await?;
        as_string(v, "content")
    }

    async fn url(&self, frame: &FrameRef) -> Result<String> {
        let v = self.call("url", frame, json!({}), READ_TIMEOUT).await?;
        as_string(v, "url")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_matched_by_id() {
        assert!(parse_reply(r#"{"id":3,"ok":true,"result":"x"}"#, 4).is_none());
        assert!(parse_reply("warning: something on stdout", 4).is_none());
        let v = parse_reply(r#"{"id":4,"ok":true,"result":[1]}"#, 4).unwrap().unwrap();
        assert_eq!(v, json!([1]));
        let v = parse_reply(r#"{"id":4,"ok":true}"#, 4).unwrap().unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn driver_errors_map_to_error_kinds() {
        let timeout = parse_reply(
            r#"{"id":1,"ok":false,"error":{"code":"timeout","message":"Timeout 30000ms exceeded"}}"#,
            1,
        );
        assert!(matches!(timeout, Some(Err(Error::Timeout(_)))));
        let missing = parse_reply(r#"{"id":0,"ok":false,"error":{"code":"not_configured","message":"m"}}"#, 0);
        assert!(matches!(missing, Some(Err(Error::NotConfigured(_)))));
        let frame = parse_reply(r#"{"id":2,"ok":false,"error":{"code":"no_frame","message":"m"}}"#, 2);
        assert!(matches!(frame, Some(Err(Error::Browser(_)))));
    }

    #[test]
    fn frame_and_locator_encoding() {
        assert_eq!(frame_value(&FrameRef::Main), Value::Null);
        assert_eq!(frame_value(&FrameRef::Named("questions_container".into())), json!("questions_container"));
        assert_eq!(
            locator_value(&Locator::Text("^2$".into())),
            json!({"kind": "text", "value": "^2$"})
        );
    }

    #[tokio::test]
    async fn missing_node_is_not_configured() {
        let opts = LaunchOptions {
            node_bin: "/nonexistent/fipibank-node".to_string(),
            ..LaunchOptions::default()
        };
        let err = PlaywrightSession::launch(&opts).await.err().unwrap();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn node_path_detection_runs_on_the_runtime() {
        std::env::set_var("FIPIBANK_NODE_PATH", "/opt/fipibank/node_modules");
        let ticker = tokio::spawn(async { tokio::task::yield_now().await });
        let found = detect_node_path_for_playwright().await;
        std::env::remove_var("FIPIBANK_NODE_PATH");
        assert_eq!(found.as_deref(), Some("/opt/fipibank/node_modules"));
        ticker.await.unwrap();

        // Without the override `npm root -g` is awaited; any answer is fine.
        let _ = detect_node_path_for_playwright().await;
    }
}
