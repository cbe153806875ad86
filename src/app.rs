use crate::collectors::catalog::CatalogSource;
use crate::config::Config;
use crate::models::promotion::PromotionItem;
use crate::util::mailer::Notifier;
use crate::util::render::{self, RenderedEmail, Renderer};
use crate::util::state_store::{self, RunState};
use chrono::{DateTime, Duration, Utc};

/// How one invocation ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The interval guard fired; nothing was fetched or written.
    Skipped,
    /// Every endpoint failed; state was left alone so the next run retries.
    FetchFailed,
    Completed { fetched: usize, new: usize, delivered: bool },
    /// `--dry-run`: the email that would have gone out, if any.
    DryRun { fetched: usize, email: Option<RenderedEmail> },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::FetchFailed => 1,
            _                       => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore `min_hours_between_runs`.
    pub force:   bool,
    /// Render but never send or write state.
    pub dry_run: bool,
}

/// One pass of load state → guard → fetch → de-dupe → notify → persist.
pub struct App<'a> {
    cfg:      &'a Config,
    source:   &'a dyn CatalogSource,
    notifier: &'a dyn Notifier,
    renderer: &'a Renderer,
}

impl<'a> App<'a> {
    pub fn new(
        cfg:      &'a Config,
        source:   &'a dyn CatalogSource,
        notifier: &'a dyn Notifier,
        renderer: &'a Renderer,
    ) -> Self {
        Self { cfg, source, notifier, renderer }
    }

    pub fn run_once(&self, now: DateTime<Utc>, opts: RunOptions) -> RunOutcome {
        let path = &self.cfg.state.path;
        let mut state = state_store::load(path);

        if !opts.force && self.too_soon(&state, now) {
            tracing::info!(
                min_hours = self.cfg.schedule.min_hours_between_runs,
                last_success = state.last_success_iso.as_deref().unwrap_or(""),
                "skip: minimum interval between runs not reached"
            );
            return RunOutcome::Skipped;
        }

        let items = match self.source.fetch_free_now(now) {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "error fetching promotions");
                return RunOutcome::FetchFailed;
            }
        };

        let new_items: Vec<PromotionItem> = items.iter()
            .filter(|it| !state.is_notified(&it.identity_key()))
            .cloned()
            .collect();
        for it in &new_items {
            tracing::info!(title = %it.title, ends = %it.local_expiry(), "new promotion");
        }

        if opts.dry_run {
            let email = if new_items.is_empty() { None } else { self.render(&new_items) };
            return RunOutcome::DryRun { fetched: items.len(), email };
        }

        let delivered = if new_items.is_empty() {
            tracing::info!(fetched = items.len(), "no new items to notify");
            false
        } else {
            self.notify(&new_items, &items, &mut state)
        };

        // Fetch succeeded, so the run counts as a success for the interval
        // guard even when delivery did not happen.
        state.record_success(now);
        if let Err(e) = state_store::save(path, &state) {
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "failed to save state");
        }

        RunOutcome::Completed { fetched: items.len(), new: new_items.len(), delivered }
    }

    fn too_soon(&self, state: &RunState, now: DateTime<Utc>) -> bool {
        let hours = self.cfg.schedule.min_hours_between_runs;
        if hours == 0 { return false; }
        let Some(last) = state.last_success() else { return false };
        let Some(min) = i64::try_from(hours).ok().and_then(Duration::try_hours) else { return false };
        now - last < min
    }

    fn render(&self, new_items: &[PromotionItem]) -> Option<RenderedEmail> {
        let subject = render::subject_for(new_items);
        match self.renderer.render(new_items, &self.cfg.catalog.timezone, Some(subject.as_str())) {
            Ok(email) => Some(email),
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "error rendering email");
                None
            }
        }
    }

    /// Send one email for `new_items`. Only a confirmed send marks anything,
    /// and then every fetched item is marked.
    fn notify(&self, new_items: &[PromotionItem], fetched: &[PromotionItem], state: &mut RunState) -> bool {
        let Some(email) = self.render(new_items) else { return false };
        match self.notifier.send(&email) {
            Ok(true) => {
                for it in fetched {
                    state.mark_notified(it.identity_key());
                }
                true
            }
            Ok(false) => {
                tracing::info!(pending = new_items.len(), "delivery disabled; items stay pending");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "error sending email");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::catalog::FetchError;
    use crate::util::mailer::SendError;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct FakeSource {
        items: Vec<PromotionItem>,
        fail:  bool,
        calls: Cell<usize>,
    }

    impl FakeSource {
        fn with(items: Vec<PromotionItem>) -> Self {
            Self { items, fail: false, calls: Cell::new(0) }
        }
    }

    impl CatalogSource for FakeSource {
        fn fetch_free_now(&self, _now: DateTime<Utc>) -> Result<Vec<PromotionItem>, FetchError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(FetchError::AllEndpointsFailed { last: Box::new(FetchError::NoEndpoints) });
            }
            Ok(self.items.clone())
        }
    }

    #[derive(Clone, Copy)]
    enum Mode { Deliver, Disabled, Fail }

    struct FakeNotifier {
        mode: Mode,
        sent: RefCell<Vec<RenderedEmail>>,
    }

    impl FakeNotifier {
        fn new(mode: Mode) -> Self {
            Self { mode, sent: RefCell::new(Vec::new()) }
        }
    }

    impl Notifier for FakeNotifier {
        fn send(&self, email: &RenderedEmail) -> Result<bool, SendError> {
            self.sent.borrow_mut().push(email.clone());
            match self.mode {
                Mode::Deliver  => Ok(true),
                Mode::Disabled => Ok(false),
                Mode::Fail     => Err(SendError::Address {
                    address: "x y".into(),
                    source:  "x y".parse::<lettre::Address>().unwrap_err(),
                }),
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap()
    }

    fn item(title: &str, days: i64) -> PromotionItem {
        let end = now() + Duration::days(days);
        PromotionItem {
            title:         title.to_string(),
            image_url:     None,
            product_url:   format!("https://store.epicgames.com/en-US/p/{}", title.to_lowercase()),
            ends_at_utc:   end,
            ends_at_local: end.with_timezone(&chrono_tz::America::New_York),
        }
    }

    fn config(dir: &TempDir, min_hours: u64) -> Config {
        let mut cfg = Config::default();
        cfg.state.path = dir.path().join("state.json");
        cfg.schedule.min_hours_between_runs = min_hours;
        cfg
    }

    fn run(cfg: &Config, source: &FakeSource, notifier: &FakeNotifier, at: DateTime<Utc>, opts: RunOptions) -> RunOutcome {
        let renderer = Renderer::new().unwrap();
        App::new(cfg, source, notifier, &renderer).run_once(at, opts)
    }

    fn saved(path: &Path) -> RunState {
        state_store::load(path)
    }

    #[test]
    fn second_run_with_same_payload_sends_nothing() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let source = FakeSource::with(vec![item("Hades", 2), item("Celeste", 4)]);
        let notifier = FakeNotifier::new(Mode::Deliver);

        let first = run(&cfg, &source, &notifier, now(), RunOptions::default());
        assert!(matches!(first, RunOutcome::Completed { fetched: 2, new: 2, delivered: true }));

        let second = run(&cfg, &source, &notifier, now() + Duration::hours(1), RunOptions::default());
        assert!(matches!(second, RunOutcome::Completed { fetched: 2, new: 0, delivered: false }));
        assert_eq!(notifier.sent.borrow().len(), 1);
        assert_eq!(notifier.sent.borrow()[0].subject, "Epic Free Games: Hades, Celeste");
    }

    #[test]
    fn failed_send_retries_same_keys_next_run() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let source = FakeSource::with(vec![item("Hades", 2)]);

        let failing = FakeNotifier::new(Mode::Fail);
        let outcome = run(&cfg, &source, &failing, now(), RunOptions::default());
        assert!(matches!(outcome, RunOutcome::Completed { new: 1, delivered: false, .. }));
        assert_eq!(outcome.exit_code(), 0);

        let state = saved(&cfg.state.path);
        assert!(state.notified.is_empty());
        assert!(state.last_success().is_some());

        let working = FakeNotifier::new(Mode::Deliver);
        let retry = run(&cfg, &source, &working, now() + Duration::hours(1), RunOptions::default());
        assert!(matches!(retry, RunOutcome::Completed { new: 1, delivered: true, .. }));
        assert!(saved(&cfg.state.path).is_notified(&item("Hades", 2).identity_key()));
    }

    #[test]
    fn disabled_transport_marks_nothing() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let source = FakeSource::with(vec![item("Hades", 2)]);
        let notifier = FakeNotifier::new(Mode::Disabled);

        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());
        assert!(matches!(outcome, RunOutcome::Completed { new: 1, delivered: false, .. }));
        assert!(saved(&cfg.state.path).notified.is_empty());
    }

    #[test]
    fn success_marks_every_fetched_item_but_mails_only_new_ones() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let old = item("Hades", 2);
        let mut state = RunState::default();
        state.mark_notified(old.identity_key());
        state_store::save(&cfg.state.path, &state).unwrap();

        let source = FakeSource::with(vec![old.clone(), item("Celeste", 4)]);
        let notifier = FakeNotifier::new(Mode::Deliver);
        run(&cfg, &source, &notifier, now(), RunOptions::default());

        assert_eq!(notifier.sent.borrow()[0].subject, "Epic Free Games: Celeste");
        let keys: Vec<String> = saved(&cfg.state.path).notified.into_keys().collect();
        let mut expected = vec![old.identity_key(), item("Celeste", 4).identity_key()];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn interval_guard_skips_without_fetching() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 6);
        let mut state = RunState::default();
        state.record_success(now() - Duration::hours(2));
        state_store::save(&cfg.state.path, &state).unwrap();
        let before = std::fs::read_to_string(&cfg.state.path).unwrap();

        let source = FakeSource::with(vec![item("Hades", 2)]);
        let notifier = FakeNotifier::new(Mode::Deliver);
        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());

        assert!(matches!(outcome, RunOutcome::Skipped));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(source.calls.get(), 0);
        assert_eq!(std::fs::read_to_string(&cfg.state.path).unwrap(), before);
    }

    #[test]
    fn interval_guard_lets_old_runs_through() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 6);
        let mut state = RunState::default();
        state.record_success(now() - Duration::hours(7));
        state_store::save(&cfg.state.path, &state).unwrap();

        let source = FakeSource::with(vec![]);
        let notifier = FakeNotifier::new(Mode::Deliver);
        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());
        assert!(matches!(outcome, RunOutcome::Completed { fetched: 0, .. }));
        assert_eq!(saved(&cfg.state.path).last_success(), Some(now()));
    }

    #[test]
    fn force_and_garbage_timestamp_bypass_guard() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 6);
        let mut state = RunState::default();
        state.record_success(now() - Duration::hours(1));
        state_store::save(&cfg.state.path, &state).unwrap();

        let source = FakeSource::with(vec![]);
        let notifier = FakeNotifier::new(Mode::Deliver);
        let forced = run(&cfg, &source, &notifier, now(), RunOptions { force: true, dry_run: false });
        assert!(matches!(forced, RunOutcome::Completed { .. }));

        let garbage = RunState { last_success_iso: Some("not a date".into()), ..Default::default() };
        state_store::save(&cfg.state.path, &garbage).unwrap();
        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[test]
    fn fetch_failure_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let source = FakeSource { fail: true, ..FakeSource::with(vec![]) };
        let notifier = FakeNotifier::new(Mode::Deliver);

        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());
        assert!(matches!(outcome, RunOutcome::FetchFailed));
        assert_eq!(outcome.exit_code(), 1);
        assert!(!cfg.state.path.exists());
        assert!(notifier.sent.borrow().is_empty());
    }

    #[test]
    fn unwritable_state_file_does_not_change_outcome() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "regular file").unwrap();
        let mut cfg = config(&dir, 0);
        cfg.state.path = blocker.join("state.json");

        let source = FakeSource::with(vec![item("Hades", 2)]);
        let notifier = FakeNotifier::new(Mode::Deliver);
        let outcome = run(&cfg, &source, &notifier, now(), RunOptions::default());

        assert!(matches!(outcome, RunOutcome::Completed { fetched: 1, new: 1, delivered: true }));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(notifier.sent.borrow().len(), 1);
        assert!(!cfg.state.path.exists());
    }

    #[test]
    fn dry_run_renders_but_never_sends_or_writes() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 0);
        let source = FakeSource::with(vec![item("Hades", 2)]);
        let notifier = FakeNotifier::new(Mode::Deliver);

        let outcome = run(&cfg, &source, &notifier, now(), RunOptions { force: false, dry_run: true });
        match outcome {
            RunOutcome::DryRun { fetched: 1, email: Some(email) } => {
                assert_eq!(email.subject, "Epic Free Games: Hades");
                assert!(email.html.contains("Hades"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(notifier.sent.borrow().is_empty());
        assert!(!cfg.state.path.exists());
    }
}
