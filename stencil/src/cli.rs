//! Command-line surface
//!
//! `stencil build <registry> [-o dir]` turns a registry definition into
//! distributable artifacts; `stencil add <package...>` materializes packages
//! into a project tree, prompting for plugin capabilities and confirming
//! each write with a diff unless told otherwise.

use crate::build::{BuildHooks, RegistryBuilder, DEFAULT_OUTPUT_DIR};
use crate::data::MapDataSource;
use crate::diff;
use crate::generator::PackageGenerator;
use crate::project::Project;
use crate::registry::load_package;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use stencil_plugin_host::toolchain::{InstallHooks, ToolsProvider};
use stencil_plugin_host::{
    policy::permission_usage_list, CancelToken, Permission, PluginAccessPolicy, PluginCompiler,
};

#[derive(Debug, Parser)]
#[command(name = "stencil", version, about = "Materialize parameterized file packages into a project")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build registry artifacts from a registry definition.
    Build {
        /// Path or URL of the registry definition.
        registry: String,

        /// Directory artifacts are written to.
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,
    },

    /// Materialize one or more packages into a project.
    Add {
        /// Paths or URLs of package documents.
        #[arg(required = true)]
        packages: Vec<String>,

        /// Project root files are written under.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Write every file without per-file confirmation.
        #[arg(short = 'y', long)]
        create: bool,

        /// Fail instead of prompting; implies denying ungranted
        /// capabilities.
        #[arg(long)]
        non_interactive: bool,

        /// Pre-grant a plugin capability. Repeatable.
        #[arg(short, long, value_parser = parse_permission)]
        permission: Vec<Permission>,

        /// Set a package data value as key=value. Repeatable.
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
    },
}

fn parse_permission(s: &str) -> Result<Permission, String> {
    Permission::from_str(s).map_err(|e| {
        let known = permission_usage_list(Permission::all()).join("\n");
        format!("{e}\nknown permissions:\n{known}")
    })
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Build { registry, output } => run_build(&registry, &output),
        Command::Add {
            packages,
            root,
            create,
            non_interactive,
            permission,
            set,
        } => run_add(&packages, &root, create, non_interactive, &permission, set),
    }
}

fn run_build(registry: &str, output: &PathBuf) -> anyhow::Result<()> {
    let hooks = InstallHooks {
        on_download: Some(Box::new(|| {
            eprintln!("go toolchain not found, downloading a managed copy...");
        })),
        on_download_complete: Some(Box::new(|| {
            eprintln!("go toolchain installed");
        })),
    };
    let tools = ToolsProvider::new(hooks, CancelToken::new());

    let build_hooks = BuildHooks {
        before_package: Some(Box::new(|name: &str| {
            println!("building {name}...");
        })),
        on_package: None,
    };

    let builder = RegistryBuilder::new(&tools, CancelToken::new(), build_hooks)?;
    builder
        .build(registry, output)
        .with_context(|| format!("failed to build registry {registry}"))?;

    println!("registry written to {}", output.display());
    Ok(())
}

fn run_add(
    packages: &[String],
    root: &PathBuf,
    create: bool,
    non_interactive: bool,
    pre_granted: &[Permission],
    set: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let project = Project::open(root)?;
    let compiler = PluginCompiler::new()?;

    let mut data = MapDataSource::default();
    for (key, value) in set {
        data.insert(key, Value::String(value));
    }

    for path in packages {
        let compiled = load_package(path)?;
        let package_name = compiled.package.name.clone();

        let mut policy = PluginAccessPolicy::new(pre_granted.iter().copied());
        if !authorize_package(
            &mut policy,
            &package_name,
            &compiled.package.permissions,
            non_interactive,
            prompt_permissions,
        )? {
            eprintln!("skipping package {package_name}: permissions declined");
            continue;
        }

        let generator = PackageGenerator::new(&compiler, &policy)?
            .with_cwd(project.root())
            .with_cancel(CancelToken::new());
        let output = generator
            .generate(&compiled, &data)
            .with_context(|| format!("failed to generate package {package_name}"))?;

        for warning in &output.warnings {
            eprintln!("warning: {warning}");
        }

        for file in &output.files {
            let existing = project.read_existing(&file.target)?;
            let old = existing
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let new = String::from_utf8_lossy(&file.contents).into_owned();

            if existing.is_some() && diff::is_unchanged(&old, &new) {
                println!("{}: unchanged", file.target);
                continue;
            }

            print!("{}", diff::unified_diff(&file.target, &old, &new));

            if !create && !confirm(&format!("write {}?", file.target))? {
                println!("skipped {}", file.target);
                continue;
            }

            project.write_file(&file.target, &file.contents)?;
            println!("wrote {}", file.target);
        }

        println!("added package {package_name}");
    }

    Ok(())
}

/// Decide whether a package's plugins may run, granting any missing
/// capabilities through `prompt`. Returns false when the user declines;
/// the caller skips that package and moves on.
fn authorize_package(
    policy: &mut PluginAccessPolicy,
    package: &str,
    required: &[Permission],
    non_interactive: bool,
    prompt: impl FnOnce(&str, &[Permission]) -> io::Result<bool>,
) -> anyhow::Result<bool> {
    let denied = policy.diff(required);
    if denied.is_empty() {
        return Ok(true);
    }

    if non_interactive {
        bail!(
            "package {package} requires ungranted permissions: {}",
            denied
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    if !prompt(package, &denied)? {
        return Ok(false);
    }

    policy.grant(denied.iter().copied());
    Ok(true)
}

/// Ask the user to grant the listed capabilities. Returns false when the
/// user declines.
fn prompt_permissions(package: &str, denied: &[Permission]) -> io::Result<bool> {
    println!("package {package} requests the following permissions:");
    for line in permission_usage_list(denied) {
        println!("{line}");
    }
    confirm("grant these permissions?")
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("planet=mars").unwrap(),
            ("planet".to_string(), "mars".to_string())
        );
        assert_eq!(
            parse_key_value("url=http://x?a=b").unwrap(),
            ("url".to_string(), "http://x?a=b".to_string())
        );
        assert!(parse_key_value("no-equals").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn test_cli_parses_build() {
        let cli = Cli::try_parse_from(["stencil", "build", "registry.json", "-o", "out"]).unwrap();
        match cli.command {
            Command::Build { registry, output } => {
                assert_eq!(registry, "registry.json");
                assert_eq!(output, PathBuf::from("out"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_add_flags() {
        let cli = Cli::try_parse_from([
            "stencil",
            "add",
            "pkg.json",
            "--root",
            "proj",
            "-y",
            "--non-interactive",
            "-p",
            "cwd_ro",
            "--set",
            "planet=mars",
        ])
        .unwrap();
        match cli.command {
            Command::Add {
                packages,
                root,
                create,
                non_interactive,
                permission,
                set,
            } => {
                assert_eq!(packages, vec!["pkg.json"]);
                assert_eq!(root, PathBuf::from("proj"));
                assert!(create);
                assert!(non_interactive);
                assert_eq!(permission, vec![Permission::CwdRo]);
                assert_eq!(set, vec![("planet".to_string(), "mars".to_string())]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_a_package() {
        assert!(Cli::try_parse_from(["stencil", "add"]).is_err());
    }

    #[test]
    fn test_declined_permissions_skip_the_package() {
        let mut policy = PluginAccessPolicy::default();
        let proceed =
            authorize_package(&mut policy, "pkg", &[Permission::CwdRo], false, |_, _| Ok(false))
                .unwrap();
        assert!(!proceed);
        assert!(!policy.authorize(Permission::CwdRo));
    }

    #[test]
    fn test_accepted_permissions_are_granted() {
        let mut policy = PluginAccessPolicy::default();
        let proceed =
            authorize_package(&mut policy, "pkg", &[Permission::CwdRo], false, |_, _| Ok(true))
                .unwrap();
        assert!(proceed);
        assert!(policy.authorize(Permission::CwdRo));
    }

    #[test]
    fn test_pre_granted_permissions_skip_the_prompt() {
        let mut policy = PluginAccessPolicy::new([Permission::All]);
        let proceed = authorize_package(&mut policy, "pkg", &[Permission::CwdRo], true, |_, _| {
            panic!("prompted despite wildcard grant")
        })
        .unwrap();
        assert!(proceed);
    }

    #[test]
    fn test_non_interactive_denied_permissions_error() {
        let mut policy = PluginAccessPolicy::default();
        let err = authorize_package(&mut policy, "pkg", &[Permission::CwdRo], true, |_, _| Ok(true))
            .unwrap_err();
        assert!(err.to_string().contains("cwd_ro"));
    }

    #[test]
    fn test_unknown_permission_lists_known_ones() {
        let err = parse_permission("network").unwrap_err();
        assert!(err.contains("not a valid permission"));
        assert!(err.contains("cwd_ro"));
    }
}
