//! CLI for the grid-proof pipeline.
//!
//! Usage examples:
//!   cargo run --release -- parse "23° 11' 6\" S, 18° 22' 36\" E"
//!   cargo run --release -- synthesize --id abc "23° 11' 6\" S, 18° 22' 36\" E"
//!   cargo run --release -- demo --contributions 3
//!   cargo run --release -- prepare --book coordinates.toml
//!   cargo run --release -- deploy --book coordinates.toml --deployer-key 0x.. --participant-key 0x..
//!   cargo run --release -- verify --reviewer-key 0x..
//!   cargo run --release -- fuzz --reviewer-key 0x.. --contribution 0 --truth "23° 11' 6\" S, 18° 22' 36\" E"
//!
//! `prepare`, `deploy`, `verify` and `fuzz` talk to the JSON-RPC ledger named in
//! the `[ledger]` section of the config file. `demo` runs the whole flow against
//! an in-process ledger.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use geogrid_zkp::{
    config::ToolchainKind,
    ledger::all_events,
    pipeline::ContributionOutcome,
    utils::{EPHEMERAL_KEY_LEN, IV_LEN, MAC_LEN},
    ArtifactStore, CircomToolchain, CircuitArtifact, CircuitId, CircuitProver, Config,
    ContentStore, ContributionId, CoordinateBook, EncryptedCoordinates, EvmLedger, FuzzHarness,
    GridCoordinate, Ledger, LocalContentStore, MemoryContentStore, MemoryLedger, Pipeline,
    PipelineReport, ProofOrchestrator, ProofToolchain, ReviewResult, SimulatedToolchain,
    TrustedSetup, VerifierLifecycleManager,
};
use rand::{Rng, RngCore};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "geogrid.toml")]
    config: PathBuf,

    /// Overrides `[toolchain] kind`.
    #[arg(long, value_enum)]
    toolchain: Option<ToolchainArg>,

    /// Overrides `[artifacts] root`.
    #[arg(long)]
    artifacts: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ToolchainArg {
    Circom,
    Simulated,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a coordinate and show its grid cell.
    Parse { coordinate: String },

    /// Print the circuit source for a true coordinate.
    Synthesize {
        #[arg(long)]
        id: String,
        coordinate: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Full flow against an in-process ledger with the simulated toolchain.
    Demo {
        #[arg(long, default_value_t = 3)]
        contributions: usize,
        #[arg(long, default_value_t = 100)]
        fuzz_trials: usize,
    },

    /// Compile and key circuits for approved contributions.
    Prepare {
        #[arg(long)]
        book: PathBuf,
    },

    /// Prepare, deploy and link verifiers, then verify the configured query.
    Deploy {
        #[arg(long)]
        book: PathBuf,
        #[arg(long)]
        deployer_key: String,
        #[arg(long = "participant-key")]
        participant_keys: Vec<String>,
        #[arg(long)]
        reviewer_key: String,
    },

    /// Verify a coordinate against every bound verifier.
    Verify {
        #[arg(long)]
        reviewer_key: String,
        #[arg(long)]
        query: Option<String>,
    },

    /// Probe one contribution's verifier around its cell boundaries.
    Fuzz {
        #[arg(long)]
        reviewer_key: String,
        #[arg(long)]
        contribution: u64,
        #[arg(long)]
        truth: String,
        #[arg(long)]
        trials: Option<usize>,
    },
}

/// `coordinates.toml`: `[coordinates]` table of content URL → coordinate string.
#[derive(Debug, Deserialize)]
struct BookFile {
    coordinates: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct RunSummary {
    toolchain: &'static str,
    contributions: usize,
    bound: usize,
    failed: usize,
    verifications: usize,
    accepted: usize,
    inconsistent: usize,
    fuzz_trials: usize,
    fuzz_mismatches: usize,
    pipeline_ms: u128,
    fuzz_ms: u128,
}

impl RunSummary {
    fn from_report(toolchain: &'static str, report: &PipelineReport) -> Self {
        Self {
            toolchain,
            contributions: report.contributions.len(),
            bound: report.bound(),
            failed: report.failed(),
            verifications: report.verifications.len(),
            accepted: report.accepted(),
            inconsistent: report
                .verifications
                .iter()
                .filter_map(|(_, o)| o.record())
                .filter(|r| !r.is_consistent())
                .count(),
            pipeline_ms: report.elapsed_ms,
            ..Self::default()
        }
    }

    fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════╗");
        println!("║        GRID PROOF RUN SUMMARY                  ║");
        println!("╠════════════════════════════════════════════════╣");
        println!("║ Toolchain:              {:>12}           ║", self.toolchain);
        println!("║ Contributions:          {:>12}           ║", self.contributions);
        println!("║ Verifiers bound:        {:>12}           ║", self.bound);
        println!("║ Failed:                 {:>12}           ║", self.failed);
        println!("╠════════════════════════════════════════════════╣");
        println!("║ Verifications:          {:>12}           ║", self.verifications);
        println!("║ Accepted:               {:>12}           ║", self.accepted);
        println!("║ Inconsistent:           {:>12}           ║", self.inconsistent);
        println!("║ Pipeline:               {:>9} ms           ║", self.pipeline_ms);
        if self.fuzz_trials > 0 {
            println!("╠════════════════════════════════════════════════╣");
            println!("║ Fuzz trials:            {:>12}           ║", self.fuzz_trials);
            println!("║ Boundary mismatches:    {:>12}           ║", self.fuzz_mismatches);
            println!("║ Fuzzing:                {:>9} ms           ║", self.fuzz_ms);
        }
        println!("╚════════════════════════════════════════════════╝\n");
    }
}

fn print_report(report: &PipelineReport) {
    for (id, outcome) in &report.contributions {
        match outcome {
            ContributionOutcome::Bound(binding) => {
                println!("contribution {id}: verifier {:?}", binding.verifier)
            }
            ContributionOutcome::Skipped(reason) => println!("contribution {id}: skipped ({reason})"),
            ContributionOutcome::PrepareFailed(e) => println!("contribution {id}: prepare failed ({e})"),
            ContributionOutcome::LinkFailed(e) => println!("contribution {id}: {e}"),
        }
    }
    for (_, outcome) in &report.verifications {
        println!("{outcome}");
    }
}

fn parse_wallet(key: &str) -> Result<LocalWallet> {
    key.trim()
        .parse::<LocalWallet>()
        .context("Failed to parse private key")
}

fn load_book(path: &PathBuf) -> Result<CoordinateBook> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read coordinate book {}", path.display()))?;
    let file: BookFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse coordinate book {}", path.display()))?;
    CoordinateBook::parse(file.coordinates.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .context("Invalid coordinate in book")
}

struct Runtime {
    config: Config,
    kind: ToolchainKind,
}

impl Runtime {
    fn toolchain(&self) -> Arc<dyn ProofToolchain> {
        match self.kind {
            ToolchainKind::Circom => Arc::new(CircomToolchain::new(self.config.toolchain.circom_config())),
            ToolchainKind::Simulated => Arc::new(SimulatedToolchain::new()),
        }
    }

    /// The powers-of-tau file must exist for the external toolchain.
    fn trusted_setup(&self) -> Result<TrustedSetup> {
        match (self.kind, TrustedSetup::load(&self.config.setup.ptau)) {
            (_, Ok(setup)) => Ok(setup),
            (ToolchainKind::Simulated, Err(_)) => {
                Ok(TrustedSetup::from_bytes("simulated-ptau", b"geogrid simulated powers of tau"))
            }
            (ToolchainKind::Circom, Err(e)) => Err(e).context("Trusted setup is required"),
        }
    }

    fn store(&self) -> Result<Arc<ArtifactStore>> {
        let root = &self.config.artifacts.root;
        let store = ArtifactStore::open(root)
            .with_context(|| format!("Failed to open artifact store {}", root.display()))?;
        Ok(Arc::new(store))
    }

    fn prover(
        &self,
        store: Arc<ArtifactStore>,
        content: Arc<dyn ContentStore>,
    ) -> Result<Arc<CircuitProver>> {
        Ok(Arc::new(CircuitProver::new(
            self.toolchain(),
            store,
            content,
            Arc::new(self.trusted_setup()?),
            self.config.toolchain.max_concurrent,
            self.config.toolchain.stage_timeout(),
        )))
    }

    fn pipeline(
        &self,
        content: Arc<dyn ContentStore>,
        ledger: Arc<dyn Ledger>,
        deployer: LocalWallet,
        reviewer: LocalWallet,
    ) -> Result<Pipeline> {
        let store = self.store()?;
        let prover = self.prover(Arc::clone(&store), content)?;
        Ok(Pipeline::new(
            Arc::clone(&prover),
            Arc::clone(&ledger),
            VerifierLifecycleManager::new(Arc::clone(&ledger), store, deployer),
            ProofOrchestrator::new(prover, ledger, reviewer),
            self.config.artifacts.circomlib.clone(),
        ))
    }

    fn orchestrator(&self, ledger: Arc<dyn Ledger>, reviewer: LocalWallet) -> Result<ProofOrchestrator> {
        let prover = self.prover(self.store()?, self.content())?;
        Ok(ProofOrchestrator::new(prover, ledger, reviewer))
    }

    async fn evm_ledger(&self) -> Result<Arc<dyn Ledger>> {
        let platform: Address = self
            .config
            .ledger
            .platform_address
            .as_deref()
            .ok_or_else(|| anyhow!("[ledger] platform_address is not configured"))?
            .parse()
            .context("Invalid platform address")?;
        let ledger = EvmLedger::connect(&self.config.ledger.rpc_url, platform)
            .await
            .context("Failed to connect to ledger")?;
        Ok(Arc::new(ledger))
    }

    fn content(&self) -> Arc<dyn ContentStore> {
        Arc::new(LocalContentStore::new(&self.config.artifacts.content_dir))
    }

    fn query(&self, query: Option<&str>) -> Result<GridCoordinate> {
        let text = query.unwrap_or(&self.config.verification.query);
        GridCoordinate::parse(text).with_context(|| format!("Invalid query coordinate {text:?}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::load_from_file_or_default(&args.config);
    config.apply_env_overrides()?;
    if let Some(root) = args.artifacts {
        config.artifacts.root = root;
    }
    let kind = match args.toolchain {
        Some(ToolchainArg::Circom) => ToolchainKind::Circom,
        Some(ToolchainArg::Simulated) => ToolchainKind::Simulated,
        None => config.toolchain.kind,
    };
    let runtime = Runtime { config, kind };

    match args.command {
        Command::Parse { coordinate } => {
            let parsed = GridCoordinate::parse(&coordinate)?;
            let anchor = parsed.anchored();
            println!("coordinate: {parsed}");
            println!(
                "degrees: lat {} lon {}; minutes: lat {} lon {}",
                parsed.lat_deg, parsed.lon_deg, parsed.lat_min, parsed.lon_min
            );
            println!(
                "grid cell: lat [{}, {}) lon [{}, {})",
                anchor.lat_min,
                anchor.lat_min + 6,
                anchor.lon_min,
                anchor.lon_min + 6
            );
        }
        Command::Synthesize {
            id,
            coordinate,
            output,
        } => {
            let parsed = GridCoordinate::parse(&coordinate)?;
            let artifact = CircuitArtifact::synthesize(
                CircuitId::new(id)?,
                &parsed,
                &runtime.config.artifacts.circomlib,
            );
            match output {
                Some(path) => {
                    std::fs::write(&path, &artifact.source)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(source_digest = %hex::encode(artifact.source_digest), "Wrote {}", path.display());
                }
                None => print!("{}", artifact.source),
            }
        }
        Command::Demo {
            contributions,
            fuzz_trials,
        } => {
            if runtime.kind != ToolchainKind::Simulated {
                warn!("The in-process ledger only executes simulated verifiers; demo uses the simulated toolchain");
            }
            let runtime = Runtime {
                kind: ToolchainKind::Simulated,
                ..runtime
            };
            run_demo(&runtime, contributions, fuzz_trials).await?
        }
        Command::Prepare { book } => {
            let book = load_book(&book)?;
            let ledger = runtime.evm_ledger().await?;
            // Preparation never signs; throwaway identities fill the pipeline.
            let pipeline = runtime.pipeline(
                runtime.content(),
                ledger,
                LocalWallet::new(&mut rand::thread_rng()),
                LocalWallet::new(&mut rand::thread_rng()),
            )?;
            let (outcomes, keys) = pipeline.prepare(&book).await?;
            for (id, k) in &keys {
                println!("contribution {id}: circuit {} keyed", k.id);
            }
            for (id, outcome) in &outcomes {
                println!("contribution {id}: {outcome:?}");
            }
        }
        Command::Deploy {
            book,
            deployer_key,
            participant_keys,
            reviewer_key,
        } => {
            let book = load_book(&book)?;
            let participants = participant_keys
                .iter()
                .map(|k| parse_wallet(k))
                .collect::<Result<Vec<_>>>()?;
            let ledger = runtime.evm_ledger().await?;
            let pipeline = runtime.pipeline(
                runtime.content(),
                ledger,
                parse_wallet(&deployer_key)?,
                parse_wallet(&reviewer_key)?,
            )?;
            let report = pipeline
                .run(&book, &participants, &runtime.query(None)?)
                .await?;
            print_report(&report);
            RunSummary::from_report(toolchain_name(runtime.kind), &report).print_summary();
        }
        Command::Verify {
            reviewer_key,
            query,
        } => {
            let ledger = runtime.evm_ledger().await?;
            let orchestrator = runtime.orchestrator(ledger, parse_wallet(&reviewer_key)?)?;
            let query = runtime.query(query.as_deref())?;
            for (_, outcome) in orchestrator.verify_all(&query).await? {
                println!("{outcome}");
            }
        }
        Command::Fuzz {
            reviewer_key,
            contribution,
            truth,
            trials,
        } => {
            let truth = GridCoordinate::parse(&truth)?;
            let ledger = runtime.evm_ledger().await?;
            let binding = all_events(ledger.as_ref())
                .await?
                .iter()
                .filter_map(|e| e.binding())
                .find(|b| b.contribution_id == ContributionId(contribution))
                .ok_or_else(|| anyhow!("contribution {contribution} has no verifier"))?;
            let orchestrator = runtime.orchestrator(ledger, parse_wallet(&reviewer_key)?)?;
            let mut harness = match runtime.config.fuzz.seed {
                Some(seed) => FuzzHarness::with_seed(&orchestrator, seed),
                None => FuzzHarness::new(&orchestrator),
            };
            let trials = trials.unwrap_or(runtime.config.fuzz.trials);
            let report = harness.fuzz(&binding, &truth, trials).await;
            for record in report.mismatches(&truth) {
                println!(
                    "mismatch: query minutes lat {} lon {} signal {}",
                    record.queried.lat_min, record.queried.lon_min, record.public_signal
                );
            }
            println!(
                "{trials} trials, {} accepted, {} failed",
                report.accepted(),
                report.failures()
            );
        }
    }

    Ok(())
}

fn toolchain_name(kind: ToolchainKind) -> &'static str {
    match kind {
        ToolchainKind::Circom => "circom",
        ToolchainKind::Simulated => "simulated",
    }
}

/// Opaque ciphertext in the on-chain layout; the demo never decrypts it.
fn random_ciphertext<R: RngCore>(rng: &mut R) -> EncryptedCoordinates {
    let mut iv = [0u8; IV_LEN];
    let mut ephemeral_public_key = [0u8; EPHEMERAL_KEY_LEN];
    let mut mac = [0u8; MAC_LEN];
    let mut ciphertext = vec![0u8; 32];
    rng.fill_bytes(&mut iv);
    rng.fill_bytes(&mut ephemeral_public_key);
    rng.fill_bytes(&mut mac);
    rng.fill_bytes(&mut ciphertext);
    ephemeral_public_key[0] = 0x04;
    EncryptedCoordinates {
        iv,
        ephemeral_public_key,
        ciphertext,
        mac,
    }
}

async fn run_demo(runtime: &Runtime, contributions: usize, fuzz_trials: usize) -> Result<()> {
    if contributions == 0 {
        bail!("--contributions must be at least 1");
    }
    let mut rng = rand::thread_rng();
    let ledger = Arc::new(MemoryLedger::new());
    let content: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
    let reviewer = LocalWallet::new(&mut rng);
    let deployer = LocalWallet::new(&mut rng);
    let participants: Vec<LocalWallet> = (0..contributions).map(|_| LocalWallet::new(&mut rng)).collect();

    let query = runtime.query(None)?;
    let mut book = CoordinateBook::new();
    let mut truths = BTreeMap::new();
    for (i, participant) in participants.iter().enumerate() {
        // The first contribution shares the query's cell; the rest are scattered.
        let truth = if i == 0 {
            let cell = query.anchored();
            GridCoordinate::new(cell.lat_deg, cell.lat_min + 5, cell.lon_deg, cell.lon_min + 3)
        } else {
            GridCoordinate::new(
                rng.gen_range(-89..=89),
                rng.gen_range(0..60),
                rng.gen_range(-179..=179),
                rng.gen_range(0..60),
            )
        };
        let mut image = vec![0u8; 64];
        rng.fill_bytes(&mut image);
        let image_url = content.url(&content.put(image).await?);

        let id = ledger.create_contribution(participant, &image_url).await?;
        ledger.assign_contribution(&reviewer).await?;
        ledger
            .update_coordinates(participant, id, &random_ciphertext(&mut rng))
            .await?;
        ledger
            .review_contribution(&reviewer, id, ReviewResult::Approved)
            .await?;
        info!(id = %id, participant = ?participant.address(), "Contribution reviewed");
        book.insert(image_url, truth);
        truths.insert(id, truth);
    }

    let ledger: Arc<dyn Ledger> = ledger;
    let pipeline = runtime.pipeline(content, Arc::clone(&ledger), deployer, reviewer)?;
    let report = pipeline.run(&book, &participants, &query).await?;
    print_report(&report);

    let mut summary = RunSummary::from_report(toolchain_name(runtime.kind), &report);
    let fuzz_target = report
        .verifications
        .iter()
        .find_map(|(b, _)| truths.get(&b.contribution_id).map(|t| (b, t)));
    if let (Some((binding, truth)), true) = (fuzz_target, fuzz_trials > 0) {
        let t0 = Instant::now();
        let mut harness = match runtime.config.fuzz.seed {
            Some(seed) => FuzzHarness::with_seed(pipeline.orchestrator(), seed),
            None => FuzzHarness::new(pipeline.orchestrator()),
        };
        let fuzz = harness.fuzz(binding, truth, fuzz_trials).await;
        summary.fuzz_trials = fuzz.outcomes.len();
        summary.fuzz_mismatches = fuzz.mismatches(truth).count();
        summary.fuzz_ms = t0.elapsed().as_millis();
    }
    summary.print_summary();
    Ok(())
}
