//! Collaborators backed by configured external commands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::collaborators::{
    BuiltImage, Deployer, HealthCheck, ImageBuilder, QualityScanner, Registry, SecurityScanner,
    SourceBuilder, TestResource, TestResources, TestSuite,
};
use crate::config::{CommandsSection, ImageSection};
use crate::context::RunContext;
use crate::environment::Environment;
use crate::gate::{CheckStatus, QualityReport, SecurityReport, Severity};
use crate::runner::{render_argv, CommandOutput, CommandRunner, CommandSpec};
use crate::tagger::TagSet;

/// Resource id used when no start command is configured.
const NO_RESOURCE: &str = "none";

/// Runs every collaborator role through `[commands]`.
///
/// Stage commands (`build`, `test`, `quality`, `image_build`,
/// `security_scan`, `push`, `deploy`) are required by the stages that use
/// them. The transient test database commands are optional: without
/// `test_db_start` there is no resource and the health check passes.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    commands: CommandsSection,
    image: ImageSection,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandToolchain {
    pub fn new(commands: CommandsSection, image: ImageSection) -> Self {
        let timeout = Duration::from_secs(commands.timeout_secs.max(1));
        let working_dir = image.context.clone();
        Self {
            commands,
            image,
            working_dir,
            timeout,
        }
    }

    async fn run(
        &self,
        name: &str,
        template: Option<&Vec<String>>,
        vars: &BTreeMap<&str, String>,
    ) -> anyhow::Result<Option<CommandOutput>> {
        let Some(template) = template else {
            return Ok(None);
        };
        let mut spec = CommandSpec::new(name, render_argv(template, vars), self.timeout)
            .in_dir(self.working_dir.clone());
        for (key, value) in vars {
            spec = spec.with_env(format!("SHIPYARD_{}", key.to_ascii_uppercase()), value.clone());
        }
        CommandRunner::execute(&spec).await.map(Some)
    }

    async fn run_required(
        &self,
        name: &str,
        template: Option<&Vec<String>>,
        vars: &BTreeMap<&str, String>,
    ) -> anyhow::Result<CommandOutput> {
        self.run(name, template, vars)
            .await?
            .with_context(|| format!("no {name} command configured"))
    }
}

fn context_vars(ctx: &RunContext) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("branch", ctx.branch().to_string());
    vars.insert("build_id", ctx.build_id().to_string());
    vars.insert("env", ctx.environment.to_string());
    vars.insert("image", ctx.build_reference());
    vars.insert("tag", ctx.tags.build_tag().to_string());
    vars.insert("source", ctx.source_dir.display().to_string());
    vars
}

/// Reference for `image_reference` retagged with `tag`.
fn retag(image_reference: &str, tag: &str) -> String {
    let repository = match image_reference.rsplit_once(':') {
        Some((repo, _)) if !repo.is_empty() && !image_reference[repo.len()..].contains('/') => repo,
        _ => image_reference,
    };
    format!("{repository}:{tag}")
}

#[async_trait]
impl SourceBuilder for CommandToolchain {
    async fn build(&self, ctx: &RunContext) -> anyhow::Result<()> {
        self.run_required("build", self.commands.build.as_ref(), &context_vars(ctx))
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl TestResources for CommandToolchain {
    async fn start(&self, ctx: &RunContext) -> anyhow::Result<TestResource> {
        let fallback = format!("shipyard-test-{}", ctx.build_id());
        let output = self
            .run(
                "test_db_start",
                self.commands.test_db_start.as_ref(),
                &context_vars(ctx),
            )
            .await?;
        let id = match output {
            None => NO_RESOURCE.to_string(),
            Some(output) => {
                let output = output.check()?;
                output
                    .stdout
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string)
                    .unwrap_or(fallback)
            }
        };
        Ok(TestResource { id })
    }

    async fn release(&self, resource: &TestResource) -> anyhow::Result<()> {
        if resource.id == NO_RESOURCE {
            return Ok(());
        }
        let vars = BTreeMap::from([("resource", resource.id.clone())]);
        if let Some(output) = self
            .run("test_db_stop", self.commands.test_db_stop.as_ref(), &vars)
            .await?
        {
            output.check()?;
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for CommandToolchain {
    async fn probe(&self, resource: &TestResource) -> anyhow::Result<bool> {
        let vars = BTreeMap::from([("resource", resource.id.clone())]);
        let output = self
            .run("health_check", self.commands.health_check.as_ref(), &vars)
            .await?;
        Ok(output.map_or(true, |o| o.passed()))
    }
}

#[async_trait]
impl TestSuite for CommandToolchain {
    async fn run_tests(&self, ctx: &RunContext, resource: &TestResource) -> anyhow::Result<()> {
        let mut vars = context_vars(ctx);
        vars.insert("resource", resource.id.clone());
        self.run_required("test", self.commands.test.as_ref(), &vars)
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl QualityScanner for CommandToolchain {
    /// Stdout is read as a JSON quality report; otherwise the exit code
    /// becomes a single `quality` check.
    async fn scan_source(&self, ctx: &RunContext) -> anyhow::Result<QualityReport> {
        let output = self
            .run_required("quality", self.commands.quality.as_ref(), &context_vars(ctx))
            .await?;
        if let Ok(report) = serde_json::from_str::<QualityReport>(output.stdout.trim()) {
            return Ok(report);
        }
        let status = if output.passed() {
            CheckStatus::Ok
        } else {
            CheckStatus::Error
        };
        Ok(QualityReport::default().with_check("quality", status))
    }
}

#[async_trait]
impl ImageBuilder for CommandToolchain {
    async fn build_image(&self, ctx: &RunContext) -> anyhow::Result<BuiltImage> {
        self.run_required(
            "image_build",
            self.commands.image_build.as_ref(),
            &context_vars(ctx),
        )
        .await?
        .check()?;
        Ok(BuiltImage {
            reference: ctx.build_reference(),
            health_check: self.image.health_check.clone(),
            exposed_port: self.image.port,
        })
    }
}

#[async_trait]
impl SecurityScanner for CommandToolchain {
    /// Stdout must be a JSON security report. Scanners that exit non-zero
    /// on findings are fine as long as the report parses.
    async fn scan_image(
        &self,
        image: &BuiltImage,
        severities: &[Severity],
    ) -> anyhow::Result<SecurityReport> {
        let filter: Vec<&str> = severities.iter().map(Severity::as_str).collect();
        let vars = BTreeMap::from([
            ("image", image.reference.clone()),
            ("severities", filter.join(",")),
        ]);
        let output = self
            .run_required("security_scan", self.commands.security_scan.as_ref(), &vars)
            .await?;
        serde_json::from_str(output.stdout.trim()).with_context(|| {
            format!(
                "security scanner output is not a report (exit code {}): {}",
                output.exit_code,
                output.stderr.trim()
            )
        })
    }
}

#[async_trait]
impl Registry for CommandToolchain {
    async fn push(&self, image_reference: &str, tag: &str) -> anyhow::Result<()> {
        let vars = BTreeMap::from([
            ("image", image_reference.to_string()),
            ("tag", tag.to_string()),
            ("target", retag(image_reference, tag)),
        ]);
        self.run_required("push", self.commands.push.as_ref(), &vars)
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl Deployer for CommandToolchain {
    async fn deploy(
        &self,
        environment: Environment,
        image_reference: &str,
        tags: &TagSet,
    ) -> anyhow::Result<()> {
        let vars = BTreeMap::from([
            ("env", environment.to_string()),
            ("image", image_reference.to_string()),
            ("tag", tags.build_tag().to_string()),
        ]);
        self.run_required("deploy", self.commands.deploy.as_ref(), &vars)
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Resolver;
    use crate::stage::StagePlan;
    use crate::tagger::ImageTagger;
    use crate::trigger::Trigger;

    fn argv(parts: &[&str]) -> Option<Vec<String>> {
        Some(parts.iter().map(|s| s.to_string()).collect())
    }

    fn toolchain(commands: CommandsSection) -> CommandToolchain {
        let image = ImageSection {
            repository: "subscriptions-db".into(),
            port: Some(5432),
            ..ImageSection::default()
        };
        CommandToolchain::new(commands, image)
    }

    fn ctx(branch: &str) -> RunContext {
        let trigger = Trigger::push(branch, 7);
        let resolution = Resolver::standard().resolve(&trigger).unwrap();
        RunContext::new(
            "run-1",
            trigger,
            &resolution,
            ImageTagger::new(Some("registry.example.com".into()), "subscriptions-db"),
            &StagePlan::default(),
            PathBuf::from("."),
        )
    }

    #[test]
    fn test_retag() {
        assert_eq!(retag("registry.example.com/app:42", "latest"), "registry.example.com/app:latest");
        assert_eq!(retag("localhost:5000/app:42", "dev-latest"), "localhost:5000/app:dev-latest");
        assert_eq!(retag("localhost:5000/app", "42"), "localhost:5000/app:42");
        assert_eq!(retag("app", "42"), "app:42");
    }

    #[tokio::test]
    async fn test_build_renders_placeholders() {
        let tc = toolchain(CommandsSection {
            build: argv(&["sh", "-c", "test \"$0\" = develop", "{branch}"]),
            ..CommandsSection::default()
        });
        tc.build(&ctx("develop")).await.unwrap();

        let failing = toolchain(CommandsSection {
            build: argv(&["false"]),
            ..CommandsSection::default()
        });
        assert!(failing.build(&ctx("develop")).await.is_err());
    }

    #[tokio::test]
    async fn test_push_renders_retagged_target() {
        let tc = toolchain(CommandsSection {
            push: argv(&[
                "sh",
                "-c",
                "test \"$0\" = registry.example.com/app:42 && test \"$1\" = registry.example.com/app:latest",
                "{image}",
                "{target}",
            ]),
            ..CommandsSection::default()
        });
        tc.push("registry.example.com/app:42", "latest").await.unwrap();
        assert!(tc.push("registry.example.com/app:42", "dev-latest").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_stage_command_fails() {
        let tc = toolchain(CommandsSection::default());
        let err = tc.build(&ctx("develop")).await.unwrap_err();
        assert!(err.to_string().contains("no build command configured"));
    }

    #[tokio::test]
    async fn test_optional_resource_commands() {
        let tc = toolchain(CommandsSection::default());
        let resource = tc.start(&ctx("develop")).await.unwrap();
        assert_eq!(resource.id, NO_RESOURCE);
        assert!(tc.probe(&resource).await.unwrap());
        tc.release(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn test_resource_id_from_stdout() {
        let tc = toolchain(CommandsSection {
            test_db_start: argv(&["echo", "pg-{build_id}"]),
            health_check: argv(&["test", "{resource}", "=", "pg-7"]),
            ..CommandsSection::default()
        });
        let resource = tc.start(&ctx("develop")).await.unwrap();
        assert_eq!(resource.id, "pg-7");
        assert!(tc.probe(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_quality_report_parsing() {
        let tc = toolchain(CommandsSection {
            quality: argv(&["echo", r#"{"checks":{"coverage":"ok","bugs":"error"}}"#]),
            ..CommandsSection::default()
        });
        let report = tc.scan_source(&ctx("develop")).await.unwrap();
        assert_eq!(report.aggregate(), Some(CheckStatus::Error));

        let by_exit = toolchain(CommandsSection {
            quality: argv(&["true"]),
            ..CommandsSection::default()
        });
        let report = by_exit.scan_source(&ctx("develop")).await.unwrap();
        assert_eq!(report.aggregate(), Some(CheckStatus::Ok));
    }

    #[tokio::test]
    async fn test_security_scan_requires_report() {
        let image = BuiltImage {
            reference: "app:7".into(),
            health_check: None,
            exposed_port: None,
        };
        let tc = toolchain(CommandsSection {
            security_scan: argv(&[
                "echo",
                r#"{"findings":[{"id":"CVE-1","severity":"high"}]}"#,
            ]),
            ..CommandsSection::default()
        });
        let report = tc.scan_image(&image, &[Severity::High]).await.unwrap();
        assert_eq!(report.max_severity(), Some(Severity::High));

        let garbage = toolchain(CommandsSection {
            security_scan: argv(&["echo", "scan ok"]),
            ..CommandsSection::default()
        });
        assert!(garbage.scan_image(&image, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_image_build_reference() {
        let tc = toolchain(CommandsSection {
            image_build: argv(&["test", "{image}", "=", "registry.example.com/subscriptions-db:7"]),
            ..CommandsSection::default()
        });
        let image = tc.build_image(&ctx("develop")).await.unwrap();
        assert_eq!(image.reference, "registry.example.com/subscriptions-db:7");
        assert_eq!(image.exposed_port, Some(5432));
    }
}
