use anyhow::{Context, Result, bail};
use engine::{CanvasEngine, MemorySurface};
use replay_protocol::{ReplayAction, ReplayStep, StateDigest, StepId, compare_digests};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    /// `None` when the command ran from the queue behind an eviction.
    pub step_id: Option<StepId>,
    pub command: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub steps_applied: usize,
    pub digests_checked: usize,
    pub failures: Vec<CommandFailure>,
    pub final_digest: StateDigest,
}

pub fn digest(engine: &CanvasEngine) -> StateDigest {
    match engine.composite() {
        Some(composite) => {
            StateDigest::capture(engine.layer_count(), engine.current_layer(), composite)
        }
        None => StateDigest::unbound(engine.layer_count(), engine.current_layer()),
    }
}

/// Feeds `steps` into `engine` in order. Rejected commands are collected and
/// leave the canvas in its previous state; with `strict` the first one aborts.
pub fn run_script(
    engine: &mut CanvasEngine,
    steps: &[ReplayStep],
    strict: bool,
) -> Result<ReplayReport> {
    let mut failures = Vec::new();
    let mut digests_checked = 0;

    for step in steps {
        match &step.action {
            ReplayAction::InitCanvas => engine.init_canvas(Box::new(MemorySurface::new())),
            ReplayAction::Command { command } => {
                if let Err(error) = engine.submit(command.clone()) {
                    tracing::warn!(
                        step_id = step.step_id,
                        command = command.name(),
                        %error,
                        "replay command rejected"
                    );
                    if strict {
                        return Err(error).with_context(|| {
                            format!("step {} ({})", step.step_id, command.name())
                        });
                    }
                    failures.push(CommandFailure {
                        step_id: Some(step.step_id),
                        command: command.name(),
                        message: error.to_string(),
                    });
                }
                engine.poll_eviction();
            }
            ReplayAction::ExpectDigest { digest: expected } => {
                engine.wait_idle();
                collect_deferred(engine, &mut failures, strict)?;
                let actual = digest(engine);
                if let Err(mismatch) = compare_digests(expected, &actual) {
                    bail!("step {}: state digest mismatch: {mismatch:?}", step.step_id);
                }
                digests_checked += 1;
            }
        }
        collect_deferred(engine, &mut failures, strict)?;
    }

    engine.wait_idle();
    collect_deferred(engine, &mut failures, strict)?;
    Ok(ReplayReport {
        steps_applied: steps.len(),
        digests_checked,
        failures,
        final_digest: digest(engine),
    })
}

fn collect_deferred(
    engine: &mut CanvasEngine,
    failures: &mut Vec<CommandFailure>,
    strict: bool,
) -> Result<()> {
    for deferred in engine.take_deferred_errors() {
        if strict {
            bail!("queued {} failed: {}", deferred.command, deferred.error);
        }
        failures.push(CommandFailure {
            step_id: None,
            command: deferred.command,
            message: deferred.error.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::EngineConfig;
    use protocol::CanvasCommand;

    fn command(step_id: StepId, command: CanvasCommand) -> ReplayStep {
        ReplayStep::command(step_id, command)
    }

    fn layered_script() -> Vec<ReplayStep> {
        vec![
            command(
                1,
                CanvasCommand::UpdateSize {
                    width: Some("8".to_owned()),
                    height: Some("8".to_owned()),
                },
            ),
            ReplayStep::new(2, ReplayAction::InitCanvas),
            command(3, CanvasCommand::AddLayer),
            command(4, CanvasCommand::draw(2, 2, [255, 0, 0, 255])),
            command(5, CanvasCommand::AddLayer),
            command(6, CanvasCommand::SelectLayer { index: 1 }),
            command(7, CanvasCommand::draw(2, 2, [0, 0, 255, 255])),
            command(8, CanvasCommand::DeleteLayer { index: 1 }),
            command(9, CanvasCommand::draw(3, 3, [0, 255, 0, 255])),
        ]
    }

    #[test]
    fn background_and_synchronous_replays_agree() {
        let mut background = CanvasEngine::new(EngineConfig::default());
        let mut synchronous = CanvasEngine::new(EngineConfig::synchronous());

        let left = run_script(&mut background, &layered_script(), true).expect("replay");
        let right = run_script(&mut synchronous, &layered_script(), true).expect("replay");

        assert_eq!(left, right);
        assert_eq!(left.final_digest.layer_count, 1);
        assert_eq!(left.final_digest.current_layer, 0);
        assert_eq!(left.final_digest.opaque_pixel_count, 2);
        assert!(left.failures.is_empty());
    }

    #[test]
    fn expected_digest_is_checked() {
        let mut reference = CanvasEngine::new(EngineConfig::synchronous());
        let report = run_script(&mut reference, &layered_script(), true).expect("replay");

        let mut steps = layered_script();
        steps.push(ReplayStep::new(
            10,
            ReplayAction::ExpectDigest {
                digest: report.final_digest.clone(),
            },
        ));
        let mut engine = CanvasEngine::new(EngineConfig::default());
        let checked = run_script(&mut engine, &steps, true).expect("digest matches");
        assert_eq!(checked.digests_checked, 1);

        let mut wrong = report.final_digest;
        wrong.layer_count = 3;
        steps.push(ReplayStep::new(11, ReplayAction::ExpectDigest { digest: wrong }));
        let mut engine = CanvasEngine::new(EngineConfig::default());
        let error = run_script(&mut engine, &steps, true).expect_err("digest differs");
        assert!(error.to_string().contains("step 11"));
    }

    #[test]
    fn lenient_replay_collects_rejected_commands() {
        let mut steps = layered_script();
        steps.push(command(10, CanvasCommand::SelectLayer { index: 5 }));
        steps.push(command(11, CanvasCommand::draw(99, 0, [1, 1, 1, 1])));

        let mut engine = CanvasEngine::new(EngineConfig::synchronous());
        let report = run_script(&mut engine, &steps, false).expect("lenient replay");
        let rejected: Vec<_> = report
            .failures
            .iter()
            .map(|failure| (failure.step_id, failure.command))
            .collect();
        assert_eq!(
            rejected,
            vec![(Some(10), "select_layer"), (Some(11), "draw")]
        );
        assert_eq!(report.final_digest.opaque_pixel_count, 2);

        let mut engine = CanvasEngine::new(EngineConfig::synchronous());
        assert!(run_script(&mut engine, &steps, true).is_err());
    }

    #[test]
    fn digest_of_unbound_engine_is_empty() {
        let engine = CanvasEngine::new(EngineConfig::synchronous());
        let digest = digest(&engine);
        assert_eq!(digest, StateDigest::unbound(0, 0));
        assert_eq!(digest.width, 0);
    }
}
