// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ecp_client::cosign::{CertificateIdentity, TrustConfig};
use ecp_client::image::ImageReference;
use ecp_client::runtime::RunContext;
use ecp_client::snapshot::{ApplicationSnapshotImage, GitSource, SnapshotComponent};
use ecp_client::tracker;

#[derive(Parser)]
#[command(name = "ecp", about = "Enterprise contract verification for container images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an item against the enterprise contract.
    Validate {
        #[command(subcommand)]
        command: ValidateCommands,
    },
    /// Record and update tracking information.
    Track {
        #[command(subcommand)]
        command: TrackCommands,
    },
}

#[derive(Subcommand)]
enum ValidateCommands {
    /// Verify an image's signatures and attestations and write the input
    /// document for the policy engine.
    Image {
        /// Image reference to validate (e.g. registry.io/repo:tag)
        #[arg(long)]
        image: String,

        /// Public key (PEM) used to verify signatures; use @path to read a file
        #[arg(long)]
        public_key: Option<String>,

        /// Rekor transparency log URL
        #[arg(long)]
        rekor_url: Option<String>,

        /// Fulcio root certificate (PEM); use @path to read a file, repeatable
        #[arg(long = "fulcio-cert")]
        fulcio_certs: Vec<String>,

        /// Expected certificate identity (an email or URI SAN) for keyless
        /// verification
        #[arg(long)]
        certificate_identity: Option<String>,

        /// Expected OIDC issuer of the signing certificate
        #[arg(long)]
        certificate_oidc_issuer: Option<String>,

        /// Skip transparency log checks
        #[arg(long, default_value_t = false)]
        ignore_rekor: bool,

        /// Trust configuration file (JSON); flags override its fields
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Git URL of the component source
        #[arg(long)]
        git_url: Option<String>,

        /// Git revision of the component source
        #[arg(long)]
        git_revision: Option<String>,

        /// Extra root CA bundle (PEM file) for registry connections
        #[arg(long)]
        root_ca: Option<PathBuf>,

        /// Also write the input document to this path
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TrackCommands {
    /// Record bundle digests in a tracker log.
    Bundle {
        /// Bundle reference to track, repeatable
        #[arg(long = "bundle", required = true)]
        bundles: Vec<String>,

        /// Existing tracker file to merge with
        #[arg(long)]
        input: Option<PathBuf>,

        /// Remove records that are no longer acceptable
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        prune: bool,

        /// Re-resolve the tags of existing records to pick up new digests
        #[arg(long, default_value_t = false)]
        freshen: bool,

        /// Extra root CA bundle (PEM file) for registry connections
        #[arg(long)]
        root_ca: Option<PathBuf>,

        /// Write the tracker output here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            command:
                ValidateCommands::Image {
                    image,
                    public_key,
                    rekor_url,
                    fulcio_certs,
                    certificate_identity,
                    certificate_oidc_issuer,
                    ignore_rekor,
                    policy,
                    git_url,
                    git_revision,
                    root_ca,
                    output,
                },
        } => {
            handle_validate_image(ValidateImageArgs {
                image,
                public_key,
                rekor_url,
                fulcio_certs,
                certificate_identity,
                certificate_oidc_issuer,
                ignore_rekor,
                policy,
                git_url,
                git_revision,
                root_ca,
                output,
            })
            .await?
        }
        Commands::Track {
            command:
                TrackCommands::Bundle {
                    bundles,
                    input,
                    prune,
                    freshen,
                    root_ca,
                    output,
                },
        } => handle_track_bundle(bundles, input, prune, freshen, root_ca, output).await?,
    }

    Ok(())
}

struct ValidateImageArgs {
    image: String,
    public_key: Option<String>,
    rekor_url: Option<String>,
    fulcio_certs: Vec<String>,
    certificate_identity: Option<String>,
    certificate_oidc_issuer: Option<String>,
    ignore_rekor: bool,
    policy: Option<PathBuf>,
    git_url: Option<String>,
    git_revision: Option<String>,
    root_ca: Option<PathBuf>,
    output: Option<PathBuf>,
}

async fn handle_validate_image(args: ValidateImageArgs) -> Result<()> {
    let mut trust = match &args.policy {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("unable to read policy file {}", path.display()))?;
            serde_json::from_slice::<TrustConfig>(&bytes)
                .with_context(|| format!("unable to parse policy file {}", path.display()))?
        }
        None => TrustConfig::default(),
    };

    if let Some(public_key) = &args.public_key {
        trust.public_key = Some(load_material(public_key)?);
    }
    if args.rekor_url.is_some() {
        trust.rekor_url = args.rekor_url.clone();
    }
    for cert in &args.fulcio_certs {
        trust.fulcio_certs.push(load_material(cert)?);
    }
    if let Some(subject) = &args.certificate_identity {
        trust.certificate_identity = Some(CertificateIdentity {
            subject: subject.clone(),
            issuer: args.certificate_oidc_issuer.clone(),
        });
    }
    if args.ignore_rekor {
        trust.ignore_rekor = true;
    }

    if trust.public_key.is_none() && trust.certificate_identity.is_none() {
        bail!("either a public key or a certificate identity is required");
    }

    let ctx = RunContext::for_production(args.root_ca.as_deref())?;
    let reference =
        ImageReference::parse(&args.image).with_context(|| format!("parsing {}", args.image))?;

    let mut snapshot = ApplicationSnapshotImage::new(reference, trust);
    if let (Some(url), Some(revision)) = (&args.git_url, &args.git_revision) {
        snapshot = snapshot.with_component(SnapshotComponent {
            container_image: args.image.clone(),
            git: Some(GitSource {
                revision: revision.clone(),
                url: url.clone(),
            }),
        });
    }

    snapshot.validate_image_access(&ctx).await?;
    println!("Image access validated");
    snapshot.validate_image_signature(&ctx).await?;
    println!("Image signature validated");
    snapshot.validate_attestation_signature(&ctx).await?;
    println!("Attestation signature validated");
    snapshot.validate_attestation_syntax()?;
    println!("Attestation syntax validated");
    snapshot.fetch_image_config(&ctx).await?;
    snapshot.fetch_parent_image_config(&ctx).await?;
    snapshot.fetch_image_files(&ctx).await?;

    let (path, bytes) = snapshot.write_input_file(&ctx)?;
    println!("Input written to {}", path.display());
    if let Some(output) = &args.output {
        std::fs::write(output, &bytes)
            .with_context(|| format!("unable to write {}", output.display()))?;
    }

    Ok(())
}

async fn handle_track_bundle(
    bundles: Vec<String>,
    input: Option<PathBuf>,
    prune: bool,
    freshen: bool,
    root_ca: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let ctx = RunContext::for_production(root_ca.as_deref())?;
    let existing = match &input {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("unable to read tracker input {}", path.display()))?,
        ),
        None => None,
    };

    let out = tracker::track(&ctx, &bundles, existing.as_deref(), prune, freshen).await?;
    match &output {
        Some(path) => std::fs::write(path, &out)
            .with_context(|| format!("unable to write {}", path.display()))?,
        None => print!("{}", String::from_utf8_lossy(&out)),
    }
    Ok(())
}

/// Inline PEM, or the contents of a file when prefixed with `@`.
fn load_material(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))
        }
        None => Ok(value.to_string()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
