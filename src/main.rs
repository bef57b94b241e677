//! Keel - inspect and safely redeploy containers on a Docker host
//!
//! This is the main CLI entry point for Keel.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use keel::compose::ComposeDocument;
use keel::config::Settings;
use keel::container::ContainerDelta;
use keel::image::BuildRequest;
use keel::manager::Manager;
use keel::network::NetworkSpec;
use keel::storage::VolumeSpec;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Keel - container configuration reconciliation and redeploy
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Inspect and safely redeploy containers and compose stacks", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine address, overrides KEEL_DOCKER_HOST and DOCKER_HOST
    #[arg(long, global = true)]
    host: Option<String>,

    /// Directory for stacks created from pasted compose text
    #[arg(long, global = true)]
    stacks_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List containers
    #[command(name = "ps")]
    Ps {
        /// Show all containers
        #[arg(short, long)]
        all: bool,
    },

    /// Show container details
    Inspect {
        /// Container ID or name
        container: String,
    },

    /// Start a container
    Start {
        /// Container ID or name
        container: String,
    },

    /// Stop a container
    Stop {
        /// Container ID or name
        container: String,
    },

    /// Restart a container
    Restart {
        /// Container ID or name
        container: String,
    },

    /// Remove a container
    #[command(name = "rm")]
    Remove {
        /// Container ID or name
        container: String,
        /// Force removal
        #[arg(short, long)]
        force: bool,
    },

    /// Rename a container
    Rename {
        /// Container ID or name
        container: String,
        /// New name
        new_name: String,
    },

    /// Recreate a container with a changed configuration
    Update {
        /// Container ID or name
        container: String,
        /// New image reference
        #[arg(long)]
        image: Option<String>,
        /// Replacement environment (KEY=VALUE), repeatable
        #[arg(short, long)]
        env: Vec<String>,
        /// JSON file holding a full delta
        #[arg(long, conflicts_with_all = ["image", "env"])]
        delta_file: Option<PathBuf>,
    },

    /// Recreate a container with an extra named volume mounted
    AttachVolume {
        /// Container ID or name
        container: String,
        /// Volume name
        volume: String,
        /// Mount point inside the container
        mount_point: String,
        /// Access mode (rw or ro)
        #[arg(long)]
        mode: Option<String>,
    },

    /// Compose stacks
    Compose {
        #[command(subcommand)]
        command: ComposeCommands,
    },

    /// Manage networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Manage images
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Engine information
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand)]
enum ComposeCommands {
    /// Print the compose file a container was deployed from
    Show {
        /// Container ID or name
        container: String,
    },
    /// Apply an edited compose file to a container's stack
    Edit {
        /// Any container of the stack
        container: String,
        /// Edited compose file
        file: PathBuf,
    },
    /// Create a new stack from a compose file
    Up {
        /// Compose file
        file: PathBuf,
    },
    /// Print the order services would be deployed in
    Order {
        /// Compose file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// List networks
    #[command(name = "ls")]
    List,
    /// Create a network
    Create {
        /// Network name
        name: String,
        /// Driver
        #[arg(short, long, default_value = "bridge")]
        driver: String,
        /// Driver option (KEY=VALUE), repeatable
        #[arg(short, long)]
        opt: Vec<String>,
        /// Restrict external access
        #[arg(long)]
        internal: bool,
    },
    /// Remove a network
    #[command(name = "rm")]
    Remove {
        /// Network ID or name
        network: String,
    },
    /// Connect container to network
    Connect {
        /// Network name
        network: String,
        /// Container ID or name
        container: String,
        /// Network-scoped alias, repeatable
        #[arg(long)]
        alias: Vec<String>,
    },
    /// Disconnect container from network
    Disconnect {
        /// Network name
        network: String,
        /// Container ID or name
        container: String,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    #[command(name = "ls")]
    List,
    /// Create a volume
    Create {
        /// Volume name
        name: String,
        /// Driver
        #[arg(short, long, default_value = "local")]
        driver: String,
        /// Driver option (KEY=VALUE), repeatable
        #[arg(short, long)]
        opt: Vec<String>,
        /// Declare a bind mount of this host path instead
        #[arg(long, conflicts_with_all = ["driver", "opt"])]
        host_path: Option<String>,
    },
    /// Remove a volume
    #[command(name = "rm")]
    Remove {
        /// Volume name
        volume: String,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// List images
    #[command(name = "ls")]
    List,
    /// Show image details
    Inspect {
        /// Image reference or ID
        image: String,
    },
    /// Pull an image from a registry
    Pull {
        /// Image reference
        image: String,
    },
    /// Push an image to a registry
    Push {
        /// Image reference
        image: String,
    },
    /// Create a tag that refers to an existing image
    Tag {
        /// Source image reference or ID
        source: String,
        /// Target repository[:tag]
        target: String,
    },
    /// Remove an image
    #[command(name = "rm")]
    Remove {
        /// Image reference or ID
        image: String,
        /// Remove even if a container uses it
        #[arg(short, long)]
        force: bool,
    },
    /// Build an image from a Dockerfile
    Build {
        /// Dockerfile path
        #[arg(short, long, default_value = "Dockerfile")]
        file: PathBuf,
        /// Name and optionally tag
        #[arg(short, long)]
        tag: String,
        /// Build arguments (KEY=VALUE)
        #[arg(long)]
        build_arg: Vec<String>,
        /// Do not use cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Save an image to a tar archive
    Save {
        /// Image reference
        image: String,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Load an image from a tar archive
    Load {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum SystemCommands {
    /// Show engine and host information
    Info,
    /// Show disk usage
    Df,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn key_value(entry: &str) -> Result<(&str, &str)> {
    entry
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{}'", entry))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::from_env()?;
    if let Some(host) = cli.host {
        settings.docker_host = Some(host);
    }
    if let Some(dir) = cli.stacks_dir {
        settings.stacks_dir = dir;
    }

    // Ordering a compose file needs no engine
    if let Commands::Compose {
        command: ComposeCommands::Order { file },
    } = &cli.command
    {
        let document = ComposeDocument::load(file)?;
        for warning in document.warnings() {
            eprintln!("warning: {}", warning);
        }
        for service in document.deploy_order()? {
            println!("{}", service);
        }
        return Ok(());
    }

    let manager = Manager::connect(&settings).await?;

    match cli.command {
        Commands::Ps { all } => print_json(&manager.list_containers(all).await?)?,
        Commands::Inspect { container } => {
            print_json(&manager.inspect_container(&container).await?)?
        }
        Commands::Start { container } => print_json(&manager.start(&container).await?)?,
        Commands::Stop { container } => print_json(&manager.stop(&container).await?)?,
        Commands::Restart { container } => print_json(&manager.restart(&container).await?)?,
        Commands::Remove { container, force } => {
            manager.remove(&container, force).await?;
            println!("{}", container);
        }
        Commands::Rename {
            container,
            new_name,
        } => print_json(&manager.rename(&container, &new_name).await?)?,

        Commands::Update {
            container,
            image,
            env,
            delta_file,
        } => {
            let delta = match delta_file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    ContainerDelta::from_json(&text)?
                }
                None => {
                    let mut delta = ContainerDelta {
                        image,
                        ..ContainerDelta::default()
                    };
                    if !env.is_empty() {
                        delta = delta.with_environment(env);
                    }
                    delta
                }
            };
            print_json(&manager.update(&container, delta).await?)?;
        }

        Commands::AttachVolume {
            container,
            volume,
            mount_point,
            mode,
        } => print_json(
            &manager
                .attach_volume(&container, &volume, &mount_point, mode.as_deref())
                .await?,
        )?,

        Commands::Compose { command } => match command {
            ComposeCommands::Show { container } => {
                let (path, source) = manager.compose_file(&container).await?;
                eprintln!("# {}", path.display());
                print!("{}", source);
            }
            ComposeCommands::Edit { container, file } => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                print_json(&manager.edit_compose_file(&container, text).await?)?;
            }
            ComposeCommands::Up { file } => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                print_json(&manager.create_stack(text).await?)?;
            }
            ComposeCommands::Order { .. } => {}
        },

        Commands::Network { command } => match command {
            NetworkCommands::List => print_json(&manager.list_networks().await?)?,
            NetworkCommands::Create {
                name,
                driver,
                opt,
                internal,
            } => {
                let mut spec = NetworkSpec::new(&name).driver(&driver).internal(internal);
                for entry in &opt {
                    let (key, value) = key_value(entry)?;
                    spec = spec.option(key, value);
                }
                print_json(&manager.create_network(&spec).await?)?;
            }
            NetworkCommands::Remove { network } => {
                manager.remove_network(&network).await?;
                println!("{}", network);
            }
            NetworkCommands::Connect {
                network,
                container,
                alias,
            } => print_json(&manager.connect_network(&container, &network, alias).await?)?,
            NetworkCommands::Disconnect { network, container } => {
                print_json(&manager.disconnect_network(&container, &network).await?)?
            }
        },

        Commands::Volume { command } => match command {
            VolumeCommands::List => print_json(&manager.list_volumes().await?)?,
            VolumeCommands::Create {
                name,
                driver,
                opt,
                host_path,
            } => {
                let spec = match host_path {
                    Some(path) => VolumeSpec::bind(&name, &path),
                    None => {
                        let mut spec = VolumeSpec::new(&name).driver(&driver);
                        for entry in &opt {
                            let (key, value) = key_value(entry)?;
                            spec = spec.option(key, value);
                        }
                        spec
                    }
                };
                print_json(&manager.create_volume(&spec).await?)?;
            }
            VolumeCommands::Remove { volume } => {
                manager.remove_volume(&volume).await?;
                println!("{}", volume);
            }
        },

        Commands::Image { command } => match command {
            ImageCommands::List => print_json(&manager.list_images().await?)?,
            ImageCommands::Inspect { image } => print_json(&manager.inspect_image(&image).await?)?,
            ImageCommands::Pull { image } => print_json(&manager.pull_image(&image).await?)?,
            ImageCommands::Push { image } => {
                manager.push_image(&image).await?;
                println!("{}", image);
            }
            ImageCommands::Tag { source, target } => {
                print_json(&manager.tag_image(&source, &target).await?)?
            }
            ImageCommands::Remove { image, force } => {
                for entry in manager.remove_image(&image, force).await? {
                    println!("Deleted: {}", entry);
                }
            }
            ImageCommands::Build {
                file,
                tag,
                build_arg,
                no_cache,
            } => {
                let dockerfile = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let mut request = BuildRequest::new(&dockerfile, &tag).no_cache(no_cache);
                for entry in &build_arg {
                    let (key, value) = key_value(entry)?;
                    request = request.arg(key, value);
                }
                let output = manager.build_image(&request).await?;
                for line in &output.logs {
                    eprintln!("{}", line);
                }
                print_json(&output)?;
            }
            ImageCommands::Save { image, output } => {
                let mut file = tokio::fs::File::create(&output)
                    .await
                    .with_context(|| format!("creating {}", output.display()))?;
                let written = manager.save_image(&image, &mut file).await?;
                eprintln!("Saved {} ({} bytes) to {}", image, written, output.display());
            }
            ImageCommands::Load { input } => {
                let archive = tokio::fs::read(&input)
                    .await
                    .with_context(|| format!("reading {}", input.display()))?;
                for reference in manager.import_image(Bytes::from(archive)).await? {
                    println!("Loaded image: {}", reference);
                }
            }
        },

        Commands::System { command } => match command {
            SystemCommands::Info => print_json(&manager.system_info().await?)?,
            SystemCommands::Df => print_json(&manager.disk_usage().await?)?,
        },
    }

    Ok(())
}
