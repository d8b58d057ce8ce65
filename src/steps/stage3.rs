use crate::{
    cmd::Invocation,
    config::Configuration,
    env::Environment,
    error::{ExecuteError, PreconditionError},
    steps::{disk, Phase, Step, StepContext},
};

pub const NAME: &str = "stage3";

/// Fetches the stage3 tarball and unpacks it into the target root.
///
/// There is nothing to undo once the tarball sits on freshly formatted
/// disks, so this step is not revocable.
#[derive(Debug, Default)]
pub struct Stage3Extraction;

impl Step for Stage3Extraction {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::Stage3
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        false
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        env.require_complete(disk::NAME)?;
        env.require_mounted(&config.mount_root)?;
        env.require_tool("wget")?;
        env.require_tool("tar")?;
        if config.stage3.verify_signature {
            env.require_tool("gpg")?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let config = ctx.config();
        let stage3 = &config.stage3;
        let root = config.mount_root.display().to_string();
        let tarball = config.mount_root.join(stage3.tarball_name());
        let tarball = tarball.display().to_string();
        let url = stage3.url();

        ctx.progress(5, format!("Downloading {}", stage3.tarball_name()));
        ctx.run("download", Invocation::new("wget", ["-q", "-O", tarball.as_str(), url.as_str()]))?;

        if stage3.verify_signature {
            let signature = format!("{}.asc", tarball);
            let signature_url = format!("{}.asc", url);
            ctx.progress(40, "Verifying tarball signature");
            ctx.run(
                "verify",
                Invocation::new("wget", ["-q", "-O", signature.as_str(), signature_url.as_str()]),
            )?;
            ctx.run(
                "verify",
                Invocation::new("gpg", ["--verify", signature.as_str(), tarball.as_str()]),
            )?;
        }

        ctx.checkpoint()?;
        ctx.progress(50, format!("Extracting into {}", root));
        ctx.run(
            "extract",
            Invocation::new(
                "tar",
                [
                    "xpf",
                    tarball.as_str(),
                    "--xattrs-include=*.*",
                    "--numeric-owner",
                    "-C",
                    root.as_str(),
                ],
            ),
        )?;

        ctx.progress(95, "Removing downloaded tarball");
        ctx.run("cleanup", Invocation::new("rm", ["-f", tarball.as_str()]))?;
        if stage3.verify_signature {
            let signature = format!("{}.asc", tarball);
            ctx.run("cleanup", Invocation::new("rm", ["-f", signature.as_str()]))?;
        }

        ctx.progress(100, "Base system unpacked");
        Ok(())
    }
}
