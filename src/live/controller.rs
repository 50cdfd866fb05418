use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    backend::ClarityBackend,
    db::{ClaritySession, LiveStatePatch, LiveTurn, SessionSnapshot, TurnFlag},
    realtime::Subscription,
};

use super::{
    state::{LiveAction, LivePhase, LiveState, Resolution},
    view::{render, LiveScreen},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const DEFAULT_CELEBRATION_DELAY: Duration = Duration::from_millis(2500);

/// What one participant currently sees.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingView {
    pub session: ClaritySession,
    pub live: LiveState,
    /// Set once this participant leaves the live view. Local only.
    pub exited: bool,
}

impl MeetingView {
    pub fn screen(&self, me: &str) -> LiveScreen {
        render(&self.session, &self.live, me, self.exited)
    }
}

struct ControllerShared {
    backend: ClarityBackend,
    me: String,
    session_id: String,
    view: watch::Sender<MeetingView>,
    celebration: Mutex<Option<JoinHandle<()>>>,
    celebration_delay: Duration,
    // Local mutations run one at a time so each starts from the last result.
    ops: tokio::sync::Mutex<()>,
}

/// Drives one participant's side of a live meeting.
///
/// Actions run through the `LiveState` reducer, show up locally right away,
/// and are written back as a field-level patch. Snapshots from the backend
/// replace the local view wholesale.
#[derive(Clone)]
pub struct LiveSessionController {
    shared: Arc<ControllerShared>,
    subscription: Arc<Mutex<Option<Subscription>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LiveSessionController {
    pub async fn open(backend: ClarityBackend, session_id: &str, me: &str) -> Result<Self> {
        Self::open_with_delay(backend, session_id, me, DEFAULT_CELEBRATION_DELAY).await
    }

    pub async fn open_with_delay(
        backend: ClarityBackend,
        session_id: &str,
        me: &str,
        celebration_delay: Duration,
    ) -> Result<Self> {
        let snapshot = backend
            .get_snapshot(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        if !snapshot.session.is_participant(me) {
            bail!("{me} is not part of session {session_id}");
        }

        let live = LiveState::from_record(&snapshot.live, &snapshot.session);
        let (view, _) = watch::channel(MeetingView {
            session: snapshot.session,
            live,
            exited: false,
        });

        let shared = Arc::new(ControllerShared {
            backend,
            me: me.to_string(),
            session_id: session_id.to_string(),
            view,
            celebration: Mutex::new(None),
            celebration_delay,
            ops: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&shared);
        let subscription = shared
            .backend
            .subscribe_to_clarity_session(session_id, move |snapshot| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_snapshot(snapshot);
                }
            });

        // A round may already be celebrating when we open.
        shared.sync_celebration_timer();
        log_info!("{} opened session {}", me, session_id);

        Ok(Self {
            shared,
            subscription: Arc::new(Mutex::new(Some(subscription))),
        })
    }

    pub fn me(&self) -> &str {
        &self.shared.me
    }

    pub fn backend(&self) -> &ClarityBackend {
        &self.shared.backend
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn view(&self) -> MeetingView {
        self.shared.view.borrow().clone()
    }

    pub fn screen(&self) -> LiveScreen {
        self.shared.view.borrow().screen(&self.shared.me)
    }

    /// Receiver that wakes on every local or remote change.
    pub fn watch(&self) -> watch::Receiver<MeetingView> {
        self.shared.view.subscribe()
    }

    /// Re-read the session from the backend.
    pub async fn snapshot(&self) -> Result<MeetingView> {
        let snapshot = self
            .shared
            .backend
            .get_snapshot(&self.shared.session_id)
            .await?
            .with_context(|| format!("session {} not found", self.shared.session_id))?;
        self.shared.apply_snapshot(snapshot);
        Ok(self.view())
    }

    pub async fn start_check(&self) -> Result<MeetingView> {
        self.shared
            .dispatch(LiveAction::StartCheck {
                by: self.shared.me.clone(),
            })
            .await
    }

    pub async fn start_prove(&self) -> Result<MeetingView> {
        self.shared
            .dispatch(LiveAction::StartProve {
                by: self.shared.me.clone(),
            })
            .await
    }

    pub async fn submit_rating(&self, value: u8) -> Result<MeetingView> {
        self.shared
            .dispatch(LiveAction::SubmitRating {
                by: self.shared.me.clone(),
                value,
            })
            .await
    }

    pub async fn acknowledge(&self) -> Result<MeetingView> {
        self.shared
            .dispatch(LiveAction::Acknowledge {
                by: self.shared.me.clone(),
            })
            .await
    }

    pub async fn skip(&self) -> Result<MeetingView> {
        self.shared
            .dispatch(LiveAction::Skip {
                by: self.shared.me.clone(),
            })
            .await
    }

    pub async fn celebration_complete(&self) -> Result<MeetingView> {
        self.shared.dispatch(LiveAction::CelebrationComplete).await
    }

    /// Log that the revealed round, or the last finished one, was not
    /// actually understood. The live state is left alone.
    pub async fn flag_misunderstanding(&self, note: Option<String>) -> Result<LiveTurn> {
        let _guard = self.shared.ops.lock().await;
        let view = self.view();
        let (round, checker_rating, responder_rating) = match &view.live.phase {
            LivePhase::Revealed(round) => (
                view.live.current_round_number(),
                round.initiator_rating,
                round.responder_rating,
            ),
            _ if view.live.ideas_discussed > 0 => (view.live.ideas_discussed, None, None),
            _ => bail!("nothing to flag yet"),
        };

        let turn = LiveTurn {
            id: Uuid::new_v4().to_string(),
            session_id: self.shared.session_id.clone(),
            round,
            actor: self.shared.me.clone(),
            flag: Some(TurnFlag::Misunderstood),
            note: note
                .map(|note| note.trim().to_string())
                .filter(|note| !note.is_empty()),
            checker_rating,
            responder_rating,
            created_at: Utc::now(),
        };
        self.shared.backend.append_live_turn(&turn).await?;
        log_info!("{} flagged round {} as misunderstood", turn.actor, round);
        Ok(turn)
    }

    /// Leave the live view locally. Nothing is written back.
    pub async fn exit_meeting(&self) -> MeetingView {
        let _guard = self.shared.ops.lock().await;
        self.shared.view.send_modify(|view| {
            if let Ok(next) = view.live.apply(&view.session, &LiveAction::ExitMeeting) {
                view.live = next.state;
            }
            view.exited = true;
        });
        self.shared.cancel_celebration();
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        self.view()
    }

    /// Leave for good: a joiner frees the partner slot, the creator ends the
    /// session.
    pub async fn leave_meeting(&self) -> Result<MeetingView> {
        let is_creator = self.view().session.creator_name == self.shared.me;
        let snapshot = if is_creator {
            self.shared
                .backend
                .end_clarity_session(&self.shared.session_id)
                .await?
        } else {
            self.shared
                .backend
                .clear_session_joiner(&self.shared.session_id)
                .await?
        };
        self.shared.apply_snapshot(snapshot);
        Ok(self.exit_meeting().await)
    }

    pub async fn end_meeting(&self) -> Result<MeetingView> {
        let snapshot = self
            .shared
            .backend
            .end_clarity_session(&self.shared.session_id)
            .await?;
        self.shared.apply_snapshot(snapshot);
        Ok(self.view())
    }
}

impl ControllerShared {
    async fn dispatch(self: &Arc<Self>, action: LiveAction) -> Result<MeetingView> {
        let _guard = self.ops.lock().await;
        let before = self.view.borrow().clone();
        if before.exited {
            bail!("already left the meeting");
        }
        if before.session.is_ended() {
            bail!("session {} has ended", self.session_id);
        }

        let transition = before.live.apply(&before.session, &action)?;
        let next = transition.state;

        self.view.send_modify(|view| view.live = next.clone());
        self.sync_celebration_timer();

        let patch = LiveStatePatch::between(&before.live.to_record(), &next.to_record());
        let resolution = transition
            .resolved
            .map(|resolution| (resolution.understood, self.resolution_turn(resolution)));
        let resolved = resolution
            .as_ref()
            .map(|(understood, turn)| (turn.round, *understood));
        let written = match resolution {
            Some((_, turn)) => {
                self.backend
                    .resolve_live_round(&self.session_id, patch, turn)
                    .await
            }
            None => {
                self.backend
                    .update_clarity_session_live_state(&self.session_id, patch)
                    .await
            }
        };
        let snapshot = match written {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log_warn!("{:?} by {} failed: {:#}", action, self.me, e);
                self.recover(before).await;
                return Err(e);
            }
        };

        if let Some((round, understood)) = resolved {
            log_debug!(
                "round {} of {} resolved, understood: {}",
                round,
                self.session_id,
                understood
            );
        }
        self.apply_snapshot(snapshot);
        Ok(self.view.borrow().clone())
    }

    /// Put back whatever the backend holds, or the pre-action view if it
    /// cannot be read. The stored stamp may equal the one shown, so this
    /// bypasses the ordering check.
    async fn recover(self: &Arc<Self>, before: MeetingView) {
        match self.backend.get_snapshot(&self.session_id).await {
            Ok(Some(snapshot)) => self.replace_view(snapshot),
            _ => {
                self.view.send_replace(before);
                self.sync_celebration_timer();
            }
        }
    }

    fn resolution_turn(&self, resolution: Resolution) -> LiveTurn {
        LiveTurn {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            round: resolution.round_number,
            actor: resolution.actor,
            flag: resolution.flag,
            note: None,
            checker_rating: resolution.round.initiator_rating,
            responder_rating: resolution.round.responder_rating,
            created_at: Utc::now(),
        }
    }

    /// Replace the local view with `snapshot` if it is newer than what is
    /// shown. Stamps strictly increase per write, so an equal stamp is a
    /// repeat of a snapshot already applied.
    fn apply_snapshot(self: &Arc<Self>, snapshot: SessionSnapshot) {
        let live = LiveState::from_record(&snapshot.live, &snapshot.session);
        let applied = self.view.send_if_modified(|view| {
            if snapshot.session.updated_at <= view.session.updated_at {
                return false;
            }
            let changed = view.session != snapshot.session || view.live != live;
            view.session = snapshot.session;
            view.live = live;
            changed
        });
        if applied {
            self.sync_celebration_timer();
        }
    }

    fn replace_view(self: &Arc<Self>, snapshot: SessionSnapshot) {
        let live = LiveState::from_record(&snapshot.live, &snapshot.session);
        self.view.send_modify(|view| {
            view.session = snapshot.session;
            view.live = live;
        });
        self.sync_celebration_timer();
    }

    /// Only the round initiator dismisses a max/max reveal, so the two
    /// clients do not race to close the same round.
    fn should_celebrate(&self) -> bool {
        let view = self.view.borrow();
        !view.exited
            && !view.session.is_ended()
            && view.live.is_celebrating()
            && view
                .live
                .round()
                .map_or(false, |round| round.initiator == self.me)
    }

    fn sync_celebration_timer(self: &Arc<Self>) {
        if !self.should_celebrate() {
            self.cancel_celebration();
            return;
        }

        let mut slot = lock(&self.celebration);
        if slot.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.celebration_delay;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // Clear our own slot first so dispatch does not abort this task.
            lock(&shared.celebration).take();
            if let Err(e) = shared.dispatch(LiveAction::CelebrationComplete).await {
                log_debug!("celebration already dismissed: {:#}", e);
            }
        }));
    }

    fn cancel_celebration(&self) {
        if let Some(handle) = lock(&self.celebration).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::db::{Database, RatingPhase};

    struct Meeting {
        _dir: TempDir,
        backend: ClarityBackend,
        alice: LiveSessionController,
        bob: LiveSessionController,
    }

    async fn meeting(delay: Duration) -> Meeting {
        let dir = TempDir::new().unwrap();
        let backend =
            ClarityBackend::new(Database::new(dir.path().join("clarity.sqlite3")).unwrap());
        let id = backend.create_clarity_session("Alice").await.unwrap();
        backend.join_clarity_session(&id, "Bob").await.unwrap();
        let alice = LiveSessionController::open_with_delay(backend.clone(), &id, "Alice", delay)
            .await
            .unwrap();
        let bob = LiveSessionController::open_with_delay(backend.clone(), &id, "Bob", delay)
            .await
            .unwrap();
        Meeting {
            _dir: dir,
            backend,
            alice,
            bob,
        }
    }

    async fn wait_for<F>(controller: &LiveSessionController, done: F) -> MeetingView
    where
        F: Fn(&MeetingView) -> bool,
    {
        let mut rx = controller.watch();
        timeout(Duration::from_secs(2), async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if done(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("view never reached the expected state")
    }

    #[tokio::test]
    async fn opening_requires_participation() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        let id = m.alice.session_id().to_string();
        assert!(LiveSessionController::open(m.backend.clone(), &id, "Carol")
            .await
            .is_err());
        assert!(LiveSessionController::open(m.backend.clone(), "missing", "Alice")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn partner_sees_round_start_and_reveal() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;

        m.alice.start_check().await.unwrap();
        wait_for(&m.bob, |v| matches!(v.live.phase, LivePhase::Rating(_))).await;

        let after_alice = m.alice.submit_rating(6).await.unwrap();
        assert!(matches!(after_alice.live.phase, LivePhase::Waiting(_)));

        m.bob.submit_rating(9).await.unwrap();
        let view = wait_for(&m.alice, |v| matches!(v.live.phase, LivePhase::Revealed(_))).await;
        assert_eq!(
            view.screen("Alice"),
            LiveScreen::Revealed {
                partner: "Bob".into(),
                my_rating: 6,
                partner_rating: 9
            }
        );
    }

    #[tokio::test]
    async fn rejected_action_leaves_state_alone() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        m.alice.start_prove().await.unwrap();
        wait_for(&m.bob, |v| !matches!(v.live.phase, LivePhase::Idle)).await;

        assert!(m.bob.start_check().await.is_err());
        assert!(m.bob.acknowledge().await.is_err());
        let stored = m
            .backend
            .get_snapshot(m.alice.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.live.rating_phase, RatingPhase::Rating);
        assert_eq!(stored.live.prover_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn skip_logs_a_flagged_turn() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        m.bob.start_check().await.unwrap();
        m.bob.submit_rating(3).await.unwrap();
        wait_for(&m.alice, |v| matches!(v.live.phase, LivePhase::Waiting(_))).await;
        m.alice.submit_rating(4).await.unwrap();
        wait_for(&m.bob, |v| matches!(v.live.phase, LivePhase::Revealed(_))).await;

        let view = m.bob.skip().await.unwrap();
        assert_eq!(view.live.phase, LivePhase::Idle);
        assert_eq!(view.live.ideas_discussed, 1);

        let turns = m.backend.get_live_turns(m.bob.session_id()).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].flag, Some(TurnFlag::Skipped));
        assert_eq!(turns[0].checker_rating, Some(3));
        assert_eq!(turns[0].responder_rating, Some(4));
    }

    #[tokio::test]
    async fn initiator_auto_dismisses_celebration() {
        let m = meeting(Duration::from_millis(30)).await;
        m.alice.start_check().await.unwrap();
        m.alice.submit_rating(10).await.unwrap();
        wait_for(&m.bob, |v| matches!(v.live.phase, LivePhase::Waiting(_))).await;
        m.bob.submit_rating(10).await.unwrap();

        let view = wait_for(&m.bob, |v| v.live.ideas_understood == 1).await;
        assert_eq!(view.live.phase, LivePhase::Idle);
        assert_eq!(view.live.ideas_discussed, 1);

        let turns = m.backend.get_live_turns(m.bob.session_id()).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].actor, "Alice");
    }

    #[tokio::test]
    async fn flagging_needs_a_round() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        assert!(m.alice.flag_misunderstanding(None).await.is_err());

        m.alice.start_check().await.unwrap();
        m.alice.submit_rating(7).await.unwrap();
        wait_for(&m.bob, |v| matches!(v.live.phase, LivePhase::Waiting(_))).await;
        m.bob.submit_rating(8).await.unwrap();
        wait_for(&m.alice, |v| matches!(v.live.phase, LivePhase::Revealed(_))).await;

        let turn = m
            .alice
            .flag_misunderstanding(Some("  missed the point  ".into()))
            .await
            .unwrap();
        assert_eq!(turn.round, 1);
        assert_eq!(turn.note.as_deref(), Some("missed the point"));
        assert_eq!(turn.checker_rating, Some(7));
    }

    #[tokio::test]
    async fn earlier_write_delivered_late_does_not_rewind() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("clarity.sqlite3")).unwrap();
        let backend = ClarityBackend::new(db.clone());
        let id = backend.create_clarity_session("Alice").await.unwrap();
        backend.join_clarity_session(&id, "Bob").await.unwrap();
        let bob = LiveSessionController::open(backend, &id, "Bob").await.unwrap();

        // The second write asks for an older time than the first got.
        let late = Utc::now() + chrono::Duration::seconds(30);
        let early = late - chrono::Duration::seconds(10);
        let start = LiveStatePatch {
            rating_phase: Some(RatingPhase::Rating),
            checker_name: Some(Some("Alice".into())),
            ..LiveStatePatch::default()
        };
        let checker = LiveStatePatch {
            rating_phase: Some(RatingPhase::Waiting),
            checker_rating: Some(Some(8)),
            checker_submitted: Some(true),
            ..LiveStatePatch::default()
        };
        let responder = LiveStatePatch {
            responder_rating: Some(Some(6)),
            responder_submitted: Some(true),
            ..LiveStatePatch::default()
        };
        db.apply_live_state_patch(&id, start, early).await.unwrap();
        let waiting = db.apply_live_state_patch(&id, checker, late).await.unwrap();
        let revealed = db.apply_live_state_patch(&id, responder, early).await.unwrap();
        assert!(revealed.session.updated_at > waiting.session.updated_at);

        bob.shared.apply_snapshot(revealed.clone());
        bob.shared.apply_snapshot(waiting);
        bob.shared.apply_snapshot(revealed);
        assert_eq!(
            bob.screen(),
            LiveScreen::Revealed {
                partner: "Alice".into(),
                my_rating: 6,
                partner_rating: 8
            }
        );
    }

    #[tokio::test]
    async fn joiner_leaving_frees_the_slot() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        let left = m.bob.leave_meeting().await.unwrap();
        assert!(left.exited);
        assert_eq!(m.bob.screen(), LiveScreen::Exited);

        let view = wait_for(&m.alice, |v| v.session.joiner_name.is_none()).await;
        assert!(!view.session.is_ended());
        assert!(matches!(
            m.alice.screen(),
            LiveScreen::AwaitingPartner { .. }
        ));
        assert!(m.bob.start_check().await.is_err());
    }

    #[tokio::test]
    async fn creator_leaving_ends_the_session() {
        let m = meeting(DEFAULT_CELEBRATION_DELAY).await;
        m.alice.leave_meeting().await.unwrap();
        wait_for(&m.bob, |v| v.session.is_ended()).await;
        assert_eq!(m.bob.screen(), LiveScreen::Ended);
        assert!(m.bob.start_prove().await.is_err());
    }
}
