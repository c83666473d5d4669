use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::bail;
use stagehand::{
    CompilationUnit, CompileEngine, DiagnosticsLog, EngineConfig, PipelineEvent, PipelineListener,
    Stage, StageContext, StageSet, StateRegistry,
};

/// Collects every pipeline event in the single total order produced by the
/// engine's serialized listener wrapper.
struct RecordingListener {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl PipelineListener for RecordingListener {
    fn notify(&mut self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn logging_passes(log: Arc<Mutex<Vec<(String, Stage)>>>) -> StageSet {
    let mut passes = StageSet::new();
    for stage in Stage::ALL {
        let log = log.clone();
        passes = passes.set(
            stage,
            move |unit: &mut CompilationUnit, ctx: &mut StageContext<'_>| -> anyhow::Result<()> {
                log.lock().unwrap().push((unit.name().to_string(), ctx.stage()));
                Ok(())
            },
        );
    }
    passes
}

#[test]
fn stages_run_in_pipeline_order_per_unit() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 4,
            ..Default::default()
        },
        StateRegistry::new(),
        logging_passes(log.clone()),
    )
    .unwrap();

    for i in 0..32 {
        engine.submit(CompilationUnit::new(format!("Unit{i}"), ())).unwrap();
    }
    engine.shutdown();
    engine.await_completion();

    let log = log.lock().unwrap();
    for i in 0..32 {
        let name = format!("Unit{i}");
        let stages: Vec<Stage> = log
            .iter()
            .filter(|(unit, _)| *unit == name)
            .map(|(_, stage)| *stage)
            .collect();
        assert_eq!(stages, Stage::ALL.to_vec(), "wrong stage order for {name}");
    }
}

#[test]
fn pre_completed_stages_are_not_rerun() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 2,
            ..Default::default()
        },
        StateRegistry::new(),
        logging_passes(log.clone()),
    )
    .unwrap();

    let mut unit = CompilationUnit::new("Preparsed", ());
    unit.mark_done(Stage::Parse);
    unit.mark_done(Stage::Enter);
    engine.submit(unit).unwrap();
    engine.shutdown();
    engine.await_completion();

    let log = log.lock().unwrap();
    let stages: Vec<Stage> = log.iter().map(|(_, stage)| *stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Attribute, Stage::Flow, Stage::Desugar, Stage::Generate]
    );
}

#[test]
fn progress_is_monotonic_and_bounded_under_load() {
    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 8,
            ..Default::default()
        },
        StateRegistry::new(),
        StageSet::new().set(
            Stage::Flow,
            |_unit: &mut CompilationUnit, _ctx: &mut StageContext<'_>| -> anyhow::Result<()> { Ok(()) },
        ),
    )
    .unwrap();

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            let mut last_compiled = 0;
            while !done.load(Ordering::SeqCst) {
                thread::yield_now();
                let snapshot = engine.progress();
                assert!(
                    snapshot.compiled <= snapshot.total,
                    "observed compiled {} > total {}",
                    snapshot.compiled,
                    snapshot.total
                );
                assert!(snapshot.compiled >= last_compiled);
                last_compiled = snapshot.compiled;
            }
        });

        for i in 0..1000 {
            engine.submit(CompilationUnit::new(format!("M{i}"), ())).unwrap();
        }
        engine.shutdown();
        engine.await_completion();
        done.store(true, Ordering::SeqCst);
    });

    let snapshot = engine.progress();
    assert_eq!(snapshot.compiled, 1000);
    assert_eq!(snapshot.total, 1000);
    assert_eq!(engine.error_count(), 0);
}

#[test]
fn rendezvous_pauses_every_worker() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 4,
            listener: Box::new(RecordingListener {
                events: events.clone(),
            }),
            ..Default::default()
        },
        StateRegistry::new(),
        StageSet::new(),
    )
    .unwrap();

    for i in 0..16 {
        engine.submit(CompilationUnit::new(format!("pre{i}"), ())).unwrap();
    }
    engine.await_completion();
    engine.rendezvous();

    for i in 0..16 {
        engine.submit(CompilationUnit::new(format!("post{i}"), ())).unwrap();
    }
    engine.shutdown();
    engine.await_completion();

    let events = events.lock().unwrap();
    let crossings: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, event)| matches!(event, PipelineEvent::RendezvousCrossed { .. }).then_some(i))
        .collect();
    assert_eq!(crossings.len(), 4, "each worker crosses the rendezvous once");

    let last_crossing = *crossings.last().unwrap();
    let first_post_start = events
        .iter()
        .position(|event| {
            matches!(event, PipelineEvent::StageStarted { unit, .. } if unit.starts_with("post"))
        })
        .expect("post-rendezvous units were processed");
    assert!(
        first_post_start > last_crossing,
        "no post-rendezvous stage may start before every worker has crossed"
    );
}

#[test]
fn discovery_failure_and_completion_end_to_end() {
    let diagnostics = Arc::new(DiagnosticsLog::new());
    let registry = StateRegistry::new();
    registry
        .register_shared("generated", || Box::new(Mutex::new(Vec::<String>::new())))
        .unwrap();

    let passes = StageSet::new()
        .set(
            Stage::Attribute,
            |unit: &mut CompilationUnit, ctx: &mut StageContext<'_>| -> anyhow::Result<()> {
                if unit.name() == "Root" {
                    // Nested unit found mid-attribution; its parse already
                    // happened as part of the enclosing unit's.
                    let mut nested = CompilationUnit::new("Leaf", ());
                    nested.mark_done(Stage::Parse);
                    ctx.discover(nested);
                }
                Ok(())
            },
        )
        .set(
            Stage::Flow,
            |unit: &mut CompilationUnit, _ctx: &mut StageContext<'_>| -> anyhow::Result<()> {
                if unit.name() == "Cursed" {
                    bail!("type error: expected int, found string");
                }
                Ok(())
            },
        )
        .set(
            Stage::Generate,
            |unit: &mut CompilationUnit, ctx: &mut StageContext<'_>| -> anyhow::Result<()> {
                let generated = ctx.shared::<Mutex<Vec<String>>>("generated")?;
                generated.lock().unwrap().push(unit.name().to_string());
                Ok(())
            },
        );

    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 4,
            diagnostics: diagnostics.clone(),
            ..Default::default()
        },
        registry,
        passes,
    )
    .unwrap();

    engine.submit(CompilationUnit::new("Root", ())).unwrap();
    engine.submit(CompilationUnit::new("Cursed", ())).unwrap();
    engine.shutdown();
    engine.await_completion();

    // Awaiting completion covers the transitively discovered Leaf too.
    let snapshot = engine.progress();
    assert_eq!(snapshot.total, 3);
    assert_eq!(snapshot.compiled, 3);

    assert_eq!(engine.error_count(), 1);
    let recorded = diagnostics.for_unit("Cursed");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].stage, Stage::Flow);
    assert!(recorded[0].message.contains("type error"));

    assert!(
        diagnostics.for_unit("Leaf").is_empty(),
        "the discovered unit compiled cleanly"
    );
}

#[test]
fn failed_unit_does_not_stall_the_run() {
    let engine = CompileEngine::new(
        EngineConfig {
            worker_count: 2,
            ..Default::default()
        },
        StateRegistry::new(),
        StageSet::new().set(
            Stage::Enter,
            |unit: &mut CompilationUnit, _ctx: &mut StageContext<'_>| -> anyhow::Result<()> {
                if unit.name().starts_with("bad") {
                    bail!("duplicate symbol");
                }
                Ok(())
            },
        ),
    )
    .unwrap();

    for i in 0..20 {
        let name = if i % 5 == 0 { format!("bad{i}") } else { format!("ok{i}") };
        engine.submit(CompilationUnit::new(name, ())).unwrap();
    }
    engine.shutdown();
    engine.await_completion();

    assert_eq!(engine.error_count(), 4);
    let snapshot = engine.progress();
    assert_eq!(snapshot.compiled, 20);
}
