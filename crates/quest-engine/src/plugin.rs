use std::time::Duration;

use quest_contracts::events::EventWriter;
use quest_contracts::migration::{migrate_legacy, MigrationReport};
use quest_contracts::paths::PluginPaths;
use quest_contracts::results::{HelpError, HelpResult};
use quest_contracts::settings::CredentialStore;

use crate::locate::ScreenshotLocator;
use crate::normalize::normalize;
use crate::provider::{
    error_chain_text, openai_provider_factory, ProviderFactory, VisionProvider, VisionRequest,
};
use crate::timer::{timer_event_args, ScheduledEmit, TIMER_DELAY, TIMER_EVENT};

const REMOTE_ERROR_MAX_CHARS: usize = 2000;

/// One plugin instance: the credential, the client built from it, and the
/// pieces a help request runs through.
pub struct QuestHelper {
    paths: PluginPaths,
    store: CredentialStore,
    locator: ScreenshotLocator,
    connect: ProviderFactory,
    events: EventWriter,
    client: Option<Box<dyn VisionProvider>>,
    timer: Option<ScheduledEmit>,
    timer_delay: Duration,
}

impl QuestHelper {
    pub fn new(paths: PluginPaths, events: EventWriter) -> Self {
        let store = CredentialStore::new(paths.settings_file());
        let locator = ScreenshotLocator::for_paths(&paths);
        Self {
            paths,
            store,
            locator,
            connect: openai_provider_factory(),
            events,
            client: None,
            timer: None,
            timer_delay: TIMER_DELAY,
        }
    }

    pub fn with_locator(mut self, locator: ScreenshotLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_provider_factory(mut self, connect: ProviderFactory) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_timer_delay(mut self, delay: Duration) -> Self {
        self.timer_delay = delay;
        self
    }

    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Build the client from the stored key if none exists yet. Idempotent.
    pub fn hydrate(&mut self) -> bool {
        if self.client.is_some() {
            return true;
        }
        let api_key = self.store.get();
        if api_key.is_empty() {
            return false;
        }
        self.client = Some((self.connect)(&api_key));
        true
    }

    pub fn set_api_key(&mut self, api_key: &str) -> bool {
        if let Err(err) = self.store.save(api_key) {
            tracing::error!("Failed to set API key: {err:#}");
            return false;
        }
        self.client = Some((self.connect)(api_key));
        tracing::info!("API key saved successfully");
        true
    }

    pub fn get_api_key(&self) -> String {
        self.store.get()
    }

    /// Latest screenshot, normalized and base64 encoded; empty when none.
    pub fn capture_screenshot(&self) -> String {
        let Some(shot) = self.locator.locate() else {
            return String::new();
        };
        match normalize(&shot.bytes) {
            Ok(image) => {
                tracing::info!(
                    "Screenshot captured: {:?} ({}x{})",
                    shot.source,
                    image.width,
                    image.height
                );
                image.base64
            }
            Err(err) => {
                tracing::error!("Failed to capture screenshot: {err:#}");
                String::new()
            }
        }
    }

    pub fn get_quest_help(&mut self, screenshot_base64: &str) -> HelpResult {
        self.quest_help_for(screenshot_base64).into()
    }

    /// Capture, then ask. The credential is checked before any capture work.
    pub fn request_quest_help(&mut self) -> HelpResult {
        if !self.hydrate() {
            return HelpError::missing_credential().into();
        }
        let screenshot = self.capture_screenshot();
        if screenshot.is_empty() {
            return HelpError::capture_failed().into();
        }
        self.get_quest_help(&screenshot)
    }

    fn quest_help_for(&mut self, screenshot_base64: &str) -> Result<String, HelpError> {
        if !self.hydrate() {
            return Err(HelpError::missing_credential());
        }
        if screenshot_base64.is_empty() {
            return Err(HelpError::empty_screenshot());
        }
        let client = self.client.as_ref().ok_or_else(HelpError::missing_credential)?;

        tracing::info!("Calling {} for quest help...", client.name());
        match client.complete(&VisionRequest::quest_help(screenshot_base64)) {
            Ok(help_text) => {
                tracing::info!(
                    "Received quest help: {}...",
                    help_text.chars().take(100).collect::<String>()
                );
                Ok(help_text)
            }
            Err(err) => {
                let detail = error_chain_text(&err, REMOTE_ERROR_MAX_CHARS);
                tracing::error!("Failed to get quest help: {detail}");
                Err(HelpError::remote(&detail))
            }
        }
    }

    pub fn on_main(&mut self) {
        tracing::info!("Quest Helper plugin starting");
        if self.hydrate() {
            tracing::info!("API key loaded from settings");
        }
    }

    pub fn on_unload(&mut self) {
        if let Some(timer) = self.timer.take() {
            if !timer.is_finished() {
                tracing::info!("cancelling pending timer");
            }
            timer.cancel();
        }
        tracing::info!("Quest Helper plugin unloading");
    }

    pub fn on_uninstall(&mut self) {
        tracing::info!("Quest Helper plugin uninstalled");
    }

    pub fn on_migration(&self) -> MigrationReport {
        tracing::info!("Migrating");
        let report = migrate_legacy(&self.paths);
        if report.total() > 0 {
            tracing::info!("migrated {} legacy entries", report.total());
        }
        report
    }

    /// Schedule `timer_event`; a timer already pending is replaced.
    pub fn start_timer(&mut self) {
        if let Some(previous) = self.timer.take() {
            previous.cancel();
        }
        self.timer = Some(ScheduledEmit::spawn(
            self.events.clone(),
            self.timer_delay,
            TIMER_EVENT,
            timer_event_args(),
        ));
    }

    pub fn take_timer(&mut self) -> Option<ScheduledEmit> {
        self.timer.take()
    }
}

impl Drop for QuestHelper {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::bail;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::{json, Value};

    use quest_contracts::results::HelpErrorKind;

    use super::*;
    use crate::locate::CaptureCommand;

    #[derive(Default)]
    struct Calls {
        count: AtomicUsize,
        keys: Mutex<Vec<String>>,
        requests: Mutex<Vec<VisionRequest>>,
    }

    struct FakeProvider {
        api_key: String,
        reply: Result<String, String>,
        calls: Arc<Calls>,
    }

    impl VisionProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn complete(&self, request: &VisionRequest) -> anyhow::Result<String> {
            self.calls.count.fetch_add(1, Ordering::SeqCst);
            self.calls.keys.lock().unwrap().push(self.api_key.clone());
            self.calls.requests.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(message) => bail!("{message}"),
            }
        }
    }

    fn fake_factory(reply: Result<&str, &str>, calls: Arc<Calls>) -> ProviderFactory {
        let reply = reply.map(str::to_string).map_err(str::to_string);
        Box::new(move |api_key| {
            Box::new(FakeProvider {
                api_key: api_key.to_string(),
                reply: reply.clone(),
                calls: calls.clone(),
            })
        })
    }

    fn no_capture_locator(dirs: Vec<std::path::PathBuf>) -> ScreenshotLocator {
        ScreenshotLocator::new(
            dirs,
            Some(CaptureCommand {
                program: "quest-helper-no-such-capture-tool".to_string(),
                args: Vec::new(),
                display: ":0".to_string(),
                timeout: Duration::from_millis(200),
            }),
        )
    }

    fn helper(root: &Path, reply: Result<&str, &str>, calls: Arc<Calls>) -> QuestHelper {
        let paths = PluginPaths::under(root.join("home"), root.join("homebrew"));
        let events = EventWriter::new(paths.events_file(), "test-session");
        let dirs = paths.screenshot_dirs();
        QuestHelper::new(paths, events)
            .with_locator(no_capture_locator(dirs))
            .with_provider_factory(fake_factory(reply, calls))
            .with_timer_delay(Duration::from_millis(30))
    }

    fn write_screenshot(dir: &Path, name: &str) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        let image = RgbImage::from_pixel(1600, 900, Rgb([30, 90, 150]));
        DynamicImage::ImageRgb8(image).save_with_format(dir.join(name), ImageFormat::Jpeg)?;
        Ok(())
    }

    #[test]
    fn set_then_get_round_trips_and_builds_client() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("ok"), calls);

        assert_eq!(plugin.get_api_key(), "");
        assert!(!plugin.has_client());
        assert!(plugin.set_api_key("sk-round-trip"));
        assert_eq!(plugin.get_api_key(), "sk-round-trip");
        assert!(plugin.has_client());
        Ok(())
    }

    #[test]
    fn failed_write_returns_false_and_keeps_client_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("ok"), calls);
        // A file where the settings directory should be makes every write fail.
        let settings_dir = plugin.paths().settings_dir.clone();
        fs::create_dir_all(settings_dir.parent().unwrap())?;
        fs::write(&settings_dir, "not a directory")?;

        assert!(!plugin.set_api_key("sk-unsaved"));
        assert!(!plugin.has_client());
        assert_eq!(plugin.get_api_key(), "");
        Ok(())
    }

    #[test]
    fn persisted_key_hydrates_a_fresh_instance() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        {
            let mut first = helper(temp.path(), Ok("ok"), calls.clone());
            assert!(first.set_api_key("sk-persisted"));
        }

        let mut second = helper(temp.path(), Ok("Go left."), calls.clone());
        assert!(!second.has_client());
        second.on_main();
        assert!(second.has_client());

        let result = second.get_quest_help("QUJD");
        assert_eq!(result, HelpResult::success("Go left."));
        assert_eq!(*calls.keys.lock().unwrap(), vec!["sk-persisted".to_string()]);
        Ok(())
    }

    #[test]
    fn get_quest_help_without_key_reports_credential_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("unused"), calls.clone());

        let result = plugin.get_quest_help("QUJD");

        let err = result.error().expect("failure");
        assert_eq!(err.kind, HelpErrorKind::MissingCredential);
        assert_eq!(
            err.message,
            "OpenAI API key not configured. Please set your API key first."
        );
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn get_quest_help_with_empty_image_skips_remote_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("unused"), calls.clone());
        assert!(plugin.set_api_key("sk-test"));

        let result = plugin.get_quest_help("");

        let err = result.error().expect("failure");
        assert_eq!(err.kind, HelpErrorKind::NoScreenshot);
        assert_eq!(
            err.message,
            "No screenshot available. Please take a screenshot first."
        );
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn remote_failure_is_stringified_into_result() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Err("rate limited (429)"), calls.clone());
        assert!(plugin.set_api_key("sk-test"));

        let result = plugin.get_quest_help("QUJD");

        let err = result.error().expect("failure");
        assert_eq!(err.kind, HelpErrorKind::RemoteCall);
        assert!(err.message.contains("rate limited (429)"), "{}", err.message);
        assert!(err.message.starts_with("Failed to get help from AI: "));
        assert_eq!(calls.count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn request_without_screenshot_fails_before_remote_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("unused"), calls.clone());
        assert!(plugin.set_api_key("sk-test"));

        let result = plugin.request_quest_help();

        let err = result.error().expect("failure");
        assert_eq!(err.kind, HelpErrorKind::NoScreenshot);
        assert!(err.message.contains("screenshot"));
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn request_without_key_short_circuits_before_capture() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let paths = PluginPaths::under(temp.path().join("home"), temp.path().join("homebrew"));
        let marker = temp.path().join("capture-ran");
        let events = EventWriter::new(paths.events_file(), "test-session");
        let mut plugin = QuestHelper::new(paths, events)
            .with_locator(ScreenshotLocator::new(
                Vec::new(),
                Some(CaptureCommand {
                    program: "sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        format!("touch '{}'", marker.display()),
                    ],
                    display: ":0".to_string(),
                    timeout: Duration::from_secs(5),
                }),
            ))
            .with_provider_factory(fake_factory(Ok("unused"), calls.clone()));

        let result = plugin.request_quest_help();

        assert_eq!(
            result.error().map(|err| err.kind),
            Some(HelpErrorKind::MissingCredential)
        );
        assert!(!marker.exists());
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn request_sends_normalized_newest_screenshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let mut plugin = helper(temp.path(), Ok("Open the chest first."), calls.clone());
        assert!(plugin.set_api_key("sk-test"));
        let steam_dir = plugin.paths().screenshot_dirs()[0].join("760").join("remote");
        write_screenshot(&steam_dir, "20261018_1.jpg")?;

        let result = plugin.request_quest_help();

        assert_eq!(result, HelpResult::success("Open the chest first."));
        let requests = calls.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-4-turbo");
        assert_eq!(requests[0].max_tokens, 500);
        let payload = requests[0].chat_payload();
        let url = payload["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or_default();
        assert!(url.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    #[test]
    fn capture_screenshot_is_empty_when_nothing_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let plugin = helper(temp.path(), Ok("unused"), Arc::new(Calls::default()));
        assert_eq!(plugin.capture_screenshot(), "");
        Ok(())
    }

    #[test]
    fn timer_emits_event_and_unload_cancels_pending_one() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut plugin = helper(temp.path(), Ok("unused"), Arc::new(Calls::default()));
        let events_path = plugin.events().path().to_path_buf();

        plugin.start_timer();
        let task = plugin.take_timer().expect("timer scheduled");
        assert!(task.wait());
        let content = fs::read_to_string(&events_path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed["event"], json!("timer_event"));

        let mut plugin = plugin.with_timer_delay(Duration::from_secs(30));
        plugin.start_timer();
        plugin.on_unload();
        assert!(plugin.take_timer().is_none());
        assert_eq!(fs::read_to_string(&events_path)?.lines().count(), 1);
        Ok(())
    }
}
