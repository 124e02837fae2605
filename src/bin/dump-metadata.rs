use clap::Parser;
use genmeta::{
    abi::{Metadata, TypeDescriptor},
    buffer::Buffer,
    builder::DescriptorInfo,
    memory::snapshot::MemorySnapshot,
    BuilderConfig, BuilderResult, GenericMetadataBuilder, MemoryReader, MetadataDump,
    SnapshotReaderWriter, ValidationOutcome, Verbosity,
};
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Build generic value metadata inside a memory snapshot and dump it"
)]
struct Args {
    /// Memory snapshot to build in (JSON)
    snapshot: PathBuf,
    /// Symbol of the generic type descriptor
    descriptor: String,
    /// Generic argument, as a symbol or a hex address (repeatable, in order)
    #[arg(short, long = "arg", value_name = "SYMBOL")]
    args: Vec<String>,
    /// Compare the built record against this existing record
    #[arg(long, value_name = "SYMBOL")]
    validate: Option<String>,
    /// Write the snapshot, including the built record, to this file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Builder log level (-v summary, -vv every pointer)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Resolves `name` as a snapshot symbol, falling back to a literal `0x` address.
fn resolve(reader: &SnapshotReaderWriter, name: &str) -> BuilderResult<Buffer<Metadata>> {
    if let Some(hex) = name.strip_prefix("0x") {
        if let Ok(address) = u64::from_str_radix(hex, 16) {
            return Ok(Buffer::new(address.into()));
        }
    }
    reader.get_symbol_pointer(name)
}

fn run(args: &Args, snapshot: MemorySnapshot) -> BuilderResult<ExitCode> {
    let mut config = BuilderConfig::from_env();
    if args.verbose > 0 {
        config.verbosity = Verbosity::from_level(args.verbose as u32);
    }
    config.validate |= args.validate.is_some();

    let reader_writer = SnapshotReaderWriter::new(snapshot, config);
    let descriptor = resolve(&reader_writer, &args.descriptor)?.cast::<TypeDescriptor>();
    let arguments = args
        .args
        .iter()
        .map(|name| resolve(&reader_writer, name).map(|b| b.address))
        .collect::<BuilderResult<Vec<_>>>()?;
    let info = DescriptorInfo::read(&reader_writer, descriptor)?;
    println!("{} ({:?}, {} arguments)", info.name, info.kind(), arguments.len());

    let mut builder = GenericMetadataBuilder::new(reader_writer);
    let extra_data_size = builder.extra_data_size(descriptor, info.pattern)?;
    let built = builder.build_generic_value_metadata(
        descriptor,
        &arguments,
        info.pattern,
        extra_data_size,
    )?;
    let built = builder.initialize_generic_metadata(built)?;
    let dump = MetadataDump::collect(builder.reader_writer(), built.record(), built.record_size())?;
    println!("{dump}");

    let mut code = ExitCode::SUCCESS;
    if let Some(original) = &args.validate {
        let original = resolve(builder.reader_writer(), original)?;
        match builder.validate(original, descriptor, &arguments)? {
            ValidationOutcome::Mismatch(diff) => {
                println!("validation failed: {diff}");
                code = ExitCode::FAILURE;
            }
            outcome => println!("validation: {outcome:?}"),
        }
    }

    if let Some(output) = &args.output {
        let snapshot = builder.into_reader_writer().into_snapshot();
        if let Err(e) = snapshot.save(output) {
            eprintln!("failed to write {}: {e}", output.display());
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(code)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose > 1 { "genmeta=trace" } else { "genmeta=debug" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter));
    if let Ok(filter) = filter {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let snapshot = match MemorySnapshot::load(&args.snapshot) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.snapshot.display());
            return ExitCode::FAILURE;
        }
    };

    match run(&args, snapshot) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
