use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee::actor::{Actor, ActorCore, ActorLoop, ActorPhase, LoopSettings};
use marquee::errors::ActorError;
use marquee::notify::AsyncNotify;
use marquee::tasks::Resumer;
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Msg {
    Record(u32),
    Slow(u64),
    Double(i64),
}

struct TestActor {
    core: ActorCore<TestActor>,
    seen: Vec<u32>,
    ticks: u32,
    fail_init: bool,
    worker_tx: Option<mpsc::UnboundedSender<AsyncNotify>>,
    results: Arc<Mutex<Vec<i64>>>,
}

impl TestActor {
    fn new() -> Self {
        Self {
            core: ActorCore::new(),
            seen: Vec::new(),
            ticks: 0,
            fail_init: false,
            worker_tx: None,
            results: Arc::default(),
        }
    }
}

impl Actor for TestActor {
    type Message = Msg;
    type Resume = AsyncNotify;

    fn name(&self) -> &str {
        "test-actor"
    }

    fn core(&mut self) -> &mut ActorCore<Self> {
        &mut self.core
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if self.fail_init {
            anyhow::bail!("refusing to start");
        }
        self.core.timers.add("tick", 10, 3, |actor: &mut TestActor| {
            actor.ticks += 1;
            Ok(())
        })?;
        Ok(())
    }

    fn handle(&mut self, message: Msg) -> anyhow::Result<()> {
        match message {
            Msg::Record(n) => self.seen.push(n),
            Msg::Slow(ms) => std::thread::sleep(Duration::from_millis(ms)),
            Msg::Double(n) => {
                let worker_tx = self
                    .worker_tx
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no worker"))?;
                let results = self.results.clone();
                self.core.tasks.start(move |suspension| async move {
                    let call_id = suspension.own_id().await;
                    let request = AsyncNotify::request("math", call_id, "double", json!(n));
                    if worker_tx.send(request).is_err() {
                        return;
                    }
                    let reply = suspension.value().await;
                    if let Some(value) = reply.result.as_ref().and_then(Value::as_i64) {
                        results.lock().unwrap().push(value);
                    }
                });
            }
        }
        Ok(())
    }
}

fn spawn_math_worker(resumer: Resumer<AsyncNotify>) -> mpsc::UnboundedSender<AsyncNotify> {
    let (tx, mut rx) = mpsc::unbounded_channel::<AsyncNotify>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let doubled = request.payload.as_i64().unwrap_or_default() * 2;
            let call_id = request.call_id;
            resumer.resume(call_id, request.into_reply(Ok(json!(doubled))));
        }
    });
    tx
}

#[tokio::test]
async fn test_overloaded_frame_sheds_the_rest_of_the_batch() {
    let settings = LoopSettings {
        abort_frame: Duration::from_millis(20),
        ..LoopSettings::default()
    };
    let (actor_loop, handle) = ActorLoop::new(TestActor::new(), settings);

    handle.send(Msg::Record(1)).await.unwrap();
    handle.send(Msg::Slow(40)).await.unwrap();
    for n in 2..=5 {
        handle.send(Msg::Record(n)).await.unwrap();
    }
    handle.quit().await.unwrap();

    let (actor, metrics) = actor_loop.run().await.unwrap();
    assert_eq!(actor.seen, vec![1]);
    assert_eq!(metrics.messages_handled, 2);
    assert_eq!(metrics.messages_shed, 4);
    assert_eq!(metrics.peak_batch, 7);
    assert_eq!(metrics.frames, 1);
}

#[tokio::test]
async fn test_next_frame_gets_a_fresh_budget() {
    let settings = LoopSettings {
        abort_frame: Duration::from_millis(20),
        ..LoopSettings::default()
    };
    let (actor_loop, handle) = ActorLoop::new(TestActor::new(), settings);
    let running = tokio::spawn(actor_loop.run());

    handle.wait_for_phase(ActorPhase::Running).await;
    handle.send(Msg::Slow(40)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.send(Msg::Record(9)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.quit().await.unwrap();

    let (actor, metrics) = running.await.unwrap().unwrap();
    assert_eq!(actor.seen, vec![9]);
    assert_eq!(metrics.messages_shed, 0);
}

#[tokio::test]
async fn test_slow_frame_counts_as_overrun_and_loop_continues() {
    let settings = LoopSettings {
        warn_frame: Duration::from_millis(5),
        ..LoopSettings::default()
    };
    let (actor_loop, handle) = ActorLoop::new(TestActor::new(), settings);
    let running = tokio::spawn(actor_loop.run());

    handle.wait_for_phase(ActorPhase::Running).await;
    handle.send(Msg::Slow(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.send(Msg::Record(4)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.quit().await.unwrap();

    let (actor, metrics) = running.await.unwrap().unwrap();
    assert_eq!(metrics.overrun_frames, 1);
    // Over the warning threshold is not over budget: nothing is shed.
    assert_eq!(metrics.messages_shed, 0);
    assert_eq!(actor.seen, vec![4]);
    assert!(metrics.slowest_frame_ms >= 20);
}

#[tokio::test(start_paused = true)]
async fn test_timers_fire_between_frames() {
    let (actor_loop, handle) = ActorLoop::new(TestActor::new(), LoopSettings::default());
    let running = tokio::spawn(actor_loop.run());

    handle.wait_for_phase(ActorPhase::Running).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.quit().await.unwrap();

    let (actor, metrics) = running.await.unwrap().unwrap();
    assert_eq!(actor.ticks, 3);
    assert_eq!(metrics.timer_fires, 3);
    assert!(metrics.frames > 10);
}

#[tokio::test(start_paused = true)]
async fn test_task_waits_for_worker_reply() {
    let mut actor = TestActor::new();
    actor.worker_tx = Some(spawn_math_worker(actor.core.tasks.resumer()));
    let results = actor.results.clone();

    let (actor_loop, handle) = ActorLoop::new(actor, LoopSettings::default());
    let running = tokio::spawn(actor_loop.run());

    for n in [1, 2, 3] {
        handle.send(Msg::Double(n)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.quit().await.unwrap();

    let (actor, metrics) = running.await.unwrap().unwrap();
    let mut doubled = results.lock().unwrap().clone();
    doubled.sort();
    assert_eq!(doubled, vec![2, 4, 6]);
    assert_eq!(metrics.tasks_started, 3);
    assert_eq!(metrics.tasks_completed, 3);
    assert!(actor.core.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_init_terminates() {
    let mut actor = TestActor::new();
    actor.fail_init = true;
    let (actor_loop, handle) = ActorLoop::new(actor, LoopSettings::default());

    let result = actor_loop.run().await;
    assert!(matches!(result, Err(ActorError::InitFailed(_))));
    assert_eq!(handle.phase().await, ActorPhase::Terminated);
    assert!(handle.is_closed());
}
