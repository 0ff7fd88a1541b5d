//! Deploy step: roll out an image and record the result.
//!
//! Every rollout attempt leaves a [`DeploymentRecord`] in the log, success
//! or not. A failure here is always fatal for the run.

use shipyard_state::{DeploymentLog, DeploymentRecord, DeploymentResult};

use crate::collaborators::Deployer;
use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::obs;

/// Runs the deployer for a run context and appends the outcome to a log.
pub struct DeployRunner;

impl DeployRunner {
    /// Deploy `image_reference` to the context's environment.
    ///
    /// # Errors
    ///
    /// `DeployFailure` when the environment is not deployable, the deployer
    /// fails, or the record cannot be persisted.
    pub async fn run(
        deployer: &dyn Deployer,
        log: &dyn DeploymentLog,
        ctx: &RunContext,
        image_reference: &str,
    ) -> Result<DeploymentRecord> {
        if !ctx.environment.is_deployable() {
            return Err(PipelineError::DeployFailure(format!(
                "environment {} is not deployable",
                ctx.environment
            )));
        }

        let outcome = deployer
            .deploy(ctx.environment, image_reference, &ctx.tags)
            .await;

        let result = match &outcome {
            Ok(()) => DeploymentResult::Succeeded,
            Err(e) => DeploymentResult::Failed {
                error: format!("{e:#}"),
            },
        };

        let record = DeploymentRecord::new(
            ctx.run_id.clone(),
            ctx.environment.as_str(),
            image_reference,
            ctx.tags.as_slice().to_vec(),
            ctx.branch(),
            ctx.build_id(),
            result,
        );

        let persisted = log.append(record.clone()).await;
        obs::emit_deploy_recorded(&record.environment, image_reference, outcome.is_ok());

        if let Err(e) = outcome {
            return Err(PipelineError::DeployFailure(format!("{e:#}")));
        }
        persisted.map_err(|e| {
            PipelineError::DeployFailure(format!("deployment succeeded but was not recorded: {e}"))
        })?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Resolver;
    use crate::stage::StagePlan;
    use crate::tagger::{ImageTagger, TagSet};
    use crate::trigger::Trigger;
    use async_trait::async_trait;
    use shipyard_state::fakes::MemoryDeploymentLog;
    use std::path::PathBuf;

    struct StaticDeployer {
        fail: bool,
    }

    #[async_trait]
    impl Deployer for StaticDeployer {
        async fn deploy(
            &self,
            _environment: crate::environment::Environment,
            _image_reference: &str,
            _tags: &TagSet,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("rollout timed out");
            }
            Ok(())
        }
    }

    fn ctx(branch: &str) -> RunContext {
        let trigger = Trigger::push(branch, 21);
        let resolution = Resolver::standard().resolve(&trigger).unwrap();
        RunContext::new(
            "run-21",
            trigger,
            &resolution,
            ImageTagger::new(Some("registry.local".into()), "db"),
            &StagePlan::default(),
            PathBuf::from("."),
        )
    }

    #[tokio::test]
    async fn deploy_records_success() {
        let log = MemoryDeploymentLog::new();
        let ctx = ctx("develop");
        let record = DeployRunner::run(
            &StaticDeployer { fail: false },
            &log,
            &ctx,
            &ctx.build_reference(),
        )
        .await
        .expect("deploy");

        assert_eq!(record.environment, "dev");
        assert_eq!(record.image_reference, "registry.local/db:21");
        assert_eq!(record.tags, vec!["21".to_string(), "dev-latest".to_string()]);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn deploy_failure_is_recorded_and_fatal() {
        let log = MemoryDeploymentLog::new();
        let ctx = ctx("develop");
        let err = DeployRunner::run(
            &StaticDeployer { fail: true },
            &log,
            &ctx,
            &ctx.build_reference(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::DeployFailure(_)));
        let records = log.list(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].result.is_success());
    }

    #[tokio::test]
    async fn deploy_refuses_unpromoted_environment() {
        let log = MemoryDeploymentLog::new();
        let ctx = ctx("feature/x");
        let err = DeployRunner::run(
            &StaticDeployer { fail: false },
            &log,
            &ctx,
            &ctx.build_reference(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::DeployFailure(_)));
        assert!(log.is_empty());
    }
}
