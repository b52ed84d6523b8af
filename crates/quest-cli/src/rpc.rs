use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use quest_engine::QuestHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Run one host call against the plugin.
pub fn dispatch(
    plugin: &mut QuestHelper,
    method: &str,
    params: &Map<String, Value>,
) -> Result<(Value, Flow)> {
    let result = match method {
        "set_api_key" => {
            let key = required_str(params, "key")?;
            Value::Bool(plugin.set_api_key(key))
        }
        "get_api_key" => Value::String(plugin.get_api_key()),
        "capture_screenshot" => Value::String(plugin.capture_screenshot()),
        "get_quest_help" => {
            let screenshot = params
                .get("screenshot_base64")
                .and_then(Value::as_str)
                .unwrap_or_default();
            plugin.get_quest_help(screenshot).to_value()
        }
        "request_quest_help" => plugin.request_quest_help().to_value(),
        "start_timer" => {
            plugin.start_timer();
            Value::Null
        }
        "uninstall" => {
            plugin.on_uninstall();
            Value::Null
        }
        "unload" => {
            plugin.on_unload();
            return Ok((Value::Null, Flow::Stop));
        }
        other => bail!("unknown method '{other}'"),
    };
    Ok((result, Flow::Continue))
}

/// Parse and answer one protocol line.
pub fn handle_line(plugin: &mut QuestHelper, line: &str) -> (Value, Flow) {
    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            return (
                json!({"id": Value::Null, "error": format!("invalid request JSON: {err}")}),
                Flow::Continue,
            )
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return (
            json!({"id": id, "error": "request is missing 'method'"}),
            Flow::Continue,
        );
    };
    let params = request
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    tracing::debug!("host call {method}");
    match dispatch(plugin, method, &params) {
        Ok((result, flow)) => (json!({"id": id, "result": result}), flow),
        Err(err) => {
            tracing::warn!("host call {method} rejected: {err:#}");
            (json!({"id": id, "error": format!("{err:#}")}), Flow::Continue)
        }
    }
}

/// Answer line-delimited calls until `unload` or end of input. The unload hook
/// always runs before returning.
pub fn serve<R: BufRead, W: Write>(
    plugin: &mut QuestHelper,
    mut input: R,
    mut output: W,
) -> Result<()> {
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match input.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                plugin.on_unload();
                return Err(err).context("failed reading host call");
            }
        }
        let (response, flow) = match std::str::from_utf8(&raw) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(plugin, line),
            Err(err) => (
                json!({"id": Value::Null, "error": format!("invalid request encoding: {err}")}),
                Flow::Continue,
            ),
        };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        if flow == Flow::Stop {
            return Ok(());
        }
    }
    plugin.on_unload();
    Ok(())
}

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    match params.get(key) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => bail!("param '{key}' must be a string"),
        None => bail!("missing param '{key}'"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;

    use quest_contracts::events::EventWriter;
    use quest_contracts::paths::PluginPaths;
    use quest_engine::{CaptureCommand, ScreenshotLocator, VisionProvider, VisionRequest};
    use serde_json::{json, Value};

    use super::*;

    struct EchoProvider;

    impl VisionProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn complete(&self, request: &VisionRequest) -> anyhow::Result<String> {
            Ok(format!("saw {} base64 chars", request.image_base64.len()))
        }
    }

    fn plugin(root: &Path) -> QuestHelper {
        let paths = PluginPaths::under(root.join("home"), root.join("homebrew"));
        let events = EventWriter::new(paths.events_file(), "rpc-test");
        QuestHelper::new(paths, events)
            .with_locator(ScreenshotLocator::new(
                Vec::new(),
                Some(CaptureCommand {
                    program: "quest-helper-no-such-capture-tool".to_string(),
                    args: Vec::new(),
                    display: ":0".to_string(),
                    timeout: Duration::from_millis(200),
                }),
            ))
            .with_provider_factory(Box::new(|_| Box::new(EchoProvider)))
    }

    fn run_lines(plugin: &mut QuestHelper, lines: &[&str]) -> anyhow::Result<Vec<Value>> {
        let input = Cursor::new(lines.join("\n"));
        let mut output = Vec::new();
        serve(plugin, input, &mut output)?;
        String::from_utf8(output)?
            .lines()
            .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
            .collect()
    }

    #[test]
    fn serve_answers_calls_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = plugin(temp.path());

        let responses = run_lines(
            &mut plugin,
            &[
                r#"{"id": 1, "method": "get_api_key"}"#,
                r#"{"id": 2, "method": "set_api_key", "params": {"key": "sk-rpc"}}"#,
                r#"{"id": 3, "method": "get_api_key"}"#,
                r#"{"id": 4, "method": "get_quest_help", "params": {"screenshot_base64": "QUJD"}}"#,
            ],
        )?;

        assert_eq!(responses[0], json!({"id": 1, "result": ""}));
        assert_eq!(responses[1], json!({"id": 2, "result": true}));
        assert_eq!(responses[2], json!({"id": 3, "result": "sk-rpc"}));
        assert_eq!(
            responses[3],
            json!({"id": 4, "result": {"success": true, "help_text": "saw 4 base64 chars"}})
        );
        Ok(())
    }

    #[test]
    fn request_quest_help_reports_missing_screenshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = plugin(temp.path());
        plugin.set_api_key("sk-rpc");

        let responses = run_lines(&mut plugin, &[r#"{"id": "a", "method": "request_quest_help"}"#])?;

        let result = &responses[0]["result"];
        assert_eq!(result["success"], json!(false));
        assert_eq!(result["error_kind"], json!("no_screenshot"));
        Ok(())
    }

    #[test]
    fn bad_lines_get_errors_without_stopping() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = plugin(temp.path());

        let responses = run_lines(
            &mut plugin,
            &[
                "{not json",
                r#"{"id": 7}"#,
                r#"{"id": 8, "method": "add", "params": {"left": 1, "right": 2}}"#,
                r#"{"id": 9, "method": "set_api_key", "params": {"key": 5}}"#,
                "",
                r#"{"id": 10, "method": "get_api_key"}"#,
            ],
        )?;

        assert_eq!(responses.len(), 5);
        assert_eq!(responses[0]["id"], Value::Null);
        assert!(responses[0]["error"]
            .as_str()
            .unwrap_or_default()
            .starts_with("invalid request JSON"));
        assert_eq!(responses[1]["error"], json!("request is missing 'method'"));
        assert_eq!(responses[2]["error"], json!("unknown method 'add'"));
        assert_eq!(responses[3]["error"], json!("param 'key' must be a string"));
        assert_eq!(responses[4], json!({"id": 10, "result": ""}));
        Ok(())
    }

    #[test]
    fn non_utf8_line_gets_an_error_and_later_calls_are_answered() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = plugin(temp.path());
        plugin.start_timer();
        let input = Cursor::new(b"\xff\xfe garbage\n{\"id\": 2, \"method\": \"get_api_key\"}".to_vec());
        let mut output = Vec::new();

        serve(&mut plugin, input, &mut output)?;

        let responses: Vec<Value> = String::from_utf8(output)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert!(responses[0]["error"]
            .as_str()
            .unwrap_or_default()
            .starts_with("invalid request encoding"));
        assert_eq!(responses[1], json!({"id": 2, "result": ""}));
        assert!(plugin.take_timer().is_none());
        Ok(())
    }

    #[test]
    fn unload_stops_the_loop() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = plugin(temp.path());

        let responses = run_lines(
            &mut plugin,
            &[
                r#"{"id": 1, "method": "start_timer"}"#,
                r#"{"id": 2, "method": "unload"}"#,
                r#"{"id": 3, "method": "get_api_key"}"#,
            ],
        )?;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1], json!({"id": 2, "result": null}));
        assert!(plugin.take_timer().is_none());
        Ok(())
    }
}
