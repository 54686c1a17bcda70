// Template command - baked images the clusters are deployed from

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use super::{cancel_on_ctrl_c, ExtraArgs, GlobalOpts, InstallerArgs, VersionArgs};
use clusterlab::DeployExtra;

#[derive(Args)]
pub struct TemplateArgs {
    #[command(subcommand)]
    pub action: TemplateAction,
}

#[derive(Subcommand)]
pub enum TemplateAction {
    /// List available templates
    List,

    /// Bake a template from an installer script
    Create {
        #[command(flatten)]
        version: VersionArgs,

        #[command(flatten)]
        installer: InstallerArgs,

        #[command(flatten)]
        extra: ExtraArgs,
    },

    /// Destroy one template
    Destroy {
        #[command(flatten)]
        version: VersionArgs,
    },

    /// Remove leftovers of interrupted bakes
    Vacuum,
}

pub async fn execute(args: TemplateArgs, opts: &GlobalOpts) -> Result<()> {
    let manager = opts.manager().await?;

    match args.action {
        TemplateAction::List => {
            let templates = manager.templates().await?;
            if templates.is_empty() {
                println!("{}", "No templates found".yellow());
                return Ok(());
            }
            println!("{:<12} {:<10} {:<14} {:<6}", "DISTRO", "VERSION", "PRODUCT", "ARCH");
            for t in templates {
                println!(
                    "{:<12} {:<10} {:<14} {:<6}",
                    t.distro.cyan(),
                    t.distro_version,
                    t.product_version,
                    t.arch
                );
            }
        }

        TemplateAction::Create { version, installer, extra } => {
            let version = version.to_version()?;
            let installer = match installer.load().await? {
                Some(installer) => installer,
                None => bail!("template create requires --installer"),
            };
            let extra = DeployExtra::from(extra);
            let cancel = cancel_on_ctrl_c();
            println!("{} Baking template {}", "🔧".cyan(), version.to_string().bold());
            manager.bake_template(&version, &installer, &extra, &cancel).await?;
            println!("{} Template {} ready", "✅".green(), version);
        }

        TemplateAction::Destroy { version } => {
            let version = version.to_version()?;
            manager.destroy_template(&version).await?;
            println!("{} Destroyed template {}", "✅".green(), version);
        }

        TemplateAction::Vacuum => {
            manager.vacuum_templates().await?;
            println!("{} Vacuumed leftover bake resources", "✅".green());
        }
    }

    Ok(())
}
