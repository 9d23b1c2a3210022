//! Auto-dialer pacing through a registered session

mod support;

use chrono::NaiveTime;
use sipdialer::domain::auto_dialer::{DialerStatus, SchedulerSettings, WorkingHours};
use sipdialer::domain::number_registry::{InMemoryNumberRegistry, NumberRegistry};
use sipdialer::domain::shared::{DialerError, NumberEntry};
use sipdialer::infrastructure::protocols::sip::{ResponseBuilder, SipMethod, SipRequest};
use std::sync::Arc;
use support::{session_config, FixedClock, Harness};
use tokio::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn pool() -> Vec<NumberEntry> {
    vec![
        NumberEntry::new("100").with_label("Front desk"),
        NumberEntry::new("200").with_label("Sales"),
        NumberEntry::new("300").with_label("Support"),
    ]
}

fn settings(cap: usize) -> SchedulerSettings {
    SchedulerSettings {
        pool: pool(),
        concurrency_cap: cap,
        min_interval_seconds: 1,
        max_interval_seconds: 2,
        working_hours: WorkingHours::default(),
        duration_override: None,
    }
}

/// 100 has one prior attempt, 300 two, 200 none
async fn seeded_registry() -> Arc<InMemoryNumberRegistry> {
    let registry = Arc::new(InMemoryNumberRegistry::with_numbers(pool()));
    registry.record_attempt_started("100").await;
    registry.record_attempt_started("300").await;
    registry.record_attempt_started("300").await;
    registry
}

fn dialed(invite: &SipRequest) -> String {
    invite
        .uri
        .trim_start_matches("sip:")
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Answer the next auto-dialed INVITE and return it with its 200
async fn answer_next(h: &mut Harness) -> (SipRequest, sipdialer::infrastructure::protocols::sip::SipResponse) {
    let invite = h.server.expect_request(SipMethod::Invite).await;
    let (ok, _ack) = h.server.answer_and_ack(&invite).await;
    (invite, ok)
}

async fn remote_hangup(h: &mut Harness, ok: &sipdialer::infrastructure::protocols::sip::SipResponse) {
    h.server.send_bye(ok).await;
    let response = h.server.expect_response().await;
    assert_eq!(response.status_code, 200);
}

#[tokio::test(start_paused = true)]
async fn test_one_call_at_a_time_fewest_attempts_first() {
    let mut h = Harness::registered_with(session_config(None), seeded_registry().await).await;
    assert_ok!(h.session.start_auto_dialer(settings(1)).await);
    assert!(h.session.is_auto_dialer_running());

    let (invite, ok) = answer_next(&mut h).await;
    assert_eq!(dialed(&invite), "200");

    tokio::time::sleep(Duration::from_secs(30)).await;
    h.server.assert_silent();
    assert_eq!(h.session.active_call_count().await, 1);
    assert_eq!(
        *h.session.auto_dialer_status().borrow(),
        DialerStatus::AtCapacity { active: 1, cap: 1 }
    );

    // 100 and 200 now tie at one attempt; pool order wins
    remote_hangup(&mut h, &ok).await;
    let (invite, ok) = answer_next(&mut h).await;
    assert_eq!(dialed(&invite), "100");
    assert!(h.session.active_call_count().await <= 1);

    remote_hangup(&mut h, &ok).await;
    let (invite, ok) = answer_next(&mut h).await;
    assert_eq!(dialed(&invite), "200");

    // stopping leaves the in-flight call alone
    h.session.stop_auto_dialer().await;
    h.session.stop_auto_dialer().await;
    assert!(!h.session.is_auto_dialer_running());
    assert_eq!(*h.session.auto_dialer_status().borrow(), DialerStatus::Stopped);
    assert_eq!(h.session.active_call_count().await, 1);

    remote_hangup(&mut h, &ok).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    h.server.assert_silent();

    assert_eq!(h.registry.attempt_count("100").await, 2);
    assert_eq!(h.registry.attempt_count("200").await, 2);
    assert_eq!(h.registry.attempt_count("300").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cap_is_never_exceeded() {
    let mut h = Harness::registered(session_config(None)).await;
    assert_ok!(h.session.start_auto_dialer(settings(2)).await);

    let (first, _) = answer_next(&mut h).await;
    let (second, _) = answer_next(&mut h).await;
    assert_ne!(dialed(&first), dialed(&second));

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.session.active_call_count().await <= 2);
    }
    h.server.assert_silent();
    h.session.stop_auto_dialer().await;
}

#[tokio::test(start_paused = true)]
async fn test_outside_working_hours_does_not_dial() {
    let evening = Arc::new(FixedClock(NaiveTime::from_hms_opt(20, 0, 0).unwrap()));
    let mut h = Harness::registered_at(
        session_config(None),
        Arc::new(InMemoryNumberRegistry::new()),
        evening,
    )
    .await;
    assert_ok!(h.session.start_auto_dialer(settings(1)).await);

    tokio::time::sleep(Duration::from_secs(300)).await;
    h.server.assert_silent();
    assert_eq!(
        *h.session.auto_dialer_status().borrow(),
        DialerStatus::OutsideWorkingHours
    );
    h.session.stop_auto_dialer().await;
}

#[tokio::test(start_paused = true)]
async fn test_overnight_window_dials() {
    let evening = Arc::new(FixedClock(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
    let mut h = Harness::registered_at(
        session_config(None),
        Arc::new(InMemoryNumberRegistry::new()),
        evening,
    )
    .await;
    let mut night = settings(1);
    night.working_hours = assert_ok!(WorkingHours::parse("22:00", "06:00"));
    assert_ok!(h.session.start_auto_dialer(night).await);

    let (invite, _) = answer_next(&mut h).await;
    assert_eq!(dialed(&invite), "100");
    h.session.stop_auto_dialer().await;
}

#[tokio::test]
async fn test_start_is_validated() {
    let h = Harness::registered(session_config(None)).await;

    let mut empty = settings(1);
    empty.pool.clear();
    assert!(matches!(
        h.session.start_auto_dialer(empty).await,
        Err(DialerError::InvalidSchedule(_))
    ));

    let mut inverted = settings(1);
    inverted.min_interval_seconds = 10;
    inverted.max_interval_seconds = 5;
    assert_err!(h.session.start_auto_dialer(inverted).await);

    assert_err!(h.session.start_auto_dialer(settings(0)).await);

    assert_ok!(h.session.start_auto_dialer(settings(1)).await);
    assert_eq!(
        h.session.start_auto_dialer(settings(1)).await,
        Err(DialerError::AlreadyRunning)
    );
    h.session.stop_auto_dialer().await;
}

#[tokio::test(start_paused = true)]
async fn test_formatted_numbers_rotate_when_calls_fail() {
    let mut h = Harness::registered(session_config(None)).await;
    let mut busy = settings(1);
    busy.pool = vec![NumberEntry::new("555-0100"), NumberEntry::new("(555) 0200")];
    assert_ok!(h.session.start_auto_dialer(busy).await);

    let mut order = Vec::new();
    for _ in 0..4 {
        let invite = h.server.expect_request(SipMethod::Invite).await;
        order.push(dialed(&invite));
        h.server.reply(&invite, ResponseBuilder::new(486)).await;
        h.server.expect_request(SipMethod::Ack).await;
    }
    h.session.stop_auto_dialer().await;

    assert_eq!(order, vec!["5550100", "5550200", "5550100", "5550200"]);
    assert_eq!(h.registry.attempt_count("5550100").await, 2);
    assert_eq!(h.registry.attempt_count("5550200").await, 2);
    assert_eq!(h.registry.attempt_count("555-0100").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_undialable_entry_is_rejected_at_start() {
    let mut h = Harness::registered(session_config(None)).await;
    let mut pool = settings(1);
    pool.pool = vec![NumberEntry::new("reception"), NumberEntry::new("100")];
    assert!(matches!(
        h.session.start_auto_dialer(pool).await,
        Err(DialerError::InvalidSchedule(_))
    ));
    assert!(!h.session.is_auto_dialer_running());

    let mut endless = settings(1);
    endless.pool[0].min_duration_seconds = Some(u64::MAX / 10);
    endless.pool[0].max_duration_seconds = Some(u64::MAX / 10);
    assert_err!(h.session.start_auto_dialer(endless).await);

    tokio::time::sleep(Duration::from_secs(120)).await;
    h.server.assert_silent();
}
