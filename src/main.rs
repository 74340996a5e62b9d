use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};

use mempack::{
    build, Compressor, Document, EccParams, HashingEmbedder, MempackError, MetaValue,
    PackConfig, PackReader, Retriever, SearchOptions,
};

// Exit codes: 0 ok, 1 generic error, 2 unrecovered corruption, 3 usage.
const EXIT_GENERIC: u8 = 1;
const EXIT_CORRUPT: u8 = 2;
const EXIT_USAGE: u8 = 3;

#[derive(Parser)]
#[command(name = "mempack", version, about = "The .mpack knowledge-pack CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a pack + ANN index from text/markdown files
    Build {
        /// Output base path; writes <BASE>.mpack and <BASE>.ann
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: zstd (default), deflate, none
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        #[arg(short, long, default_value = "3")]
        level: i32,
        /// Target chunk length in characters
        #[arg(long, default_value = "1000")]
        chunk_size: usize,
        /// Characters shared with the previous chunk
        #[arg(long, default_value = "200")]
        chunk_overlap: usize,
        /// Target uncompressed block size in KiB
        #[arg(long, default_value = "64")]
        block_size: usize,
        /// Enable Reed–Solomon parity, e.g. --ecc 4,2
        #[arg(long, value_parser = parse_ecc)]
        ecc: Option<EccParams>,
        /// Embedding dimension of the built-in hashing backend
        #[arg(long, default_value = "256")]
        dim: u32,
        /// Tag attached to every chunk of every input
        #[arg(short, long)]
        tag: Vec<String>,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Query a pack
    Search {
        /// Pack base path (or the .mpack file itself)
        pack: PathBuf,
        query: String,
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
        /// Override the pack's efSearch
        #[arg(long)]
        ef: Option<usize>,
        /// Metadata equality filter, repeatable: --filter key=value
        #[arg(short, long, value_parser = parse_filter)]
        filter: Vec<(String, MetaValue)>,
        /// Keep only chunks carrying this tag, repeatable
        #[arg(short, long)]
        tag: Vec<String>,
        /// Print full chunk text instead of a one-line preview
        #[arg(long)]
        full: bool,
    },
    /// Walk every block, verify checksums, attempt parity repair
    Verify {
        pack: PathBuf,
    },
    /// Show header, sections, config, and index parameters
    Info {
        pack: PathBuf,
    },
    /// Dump every chunk as JSONL
    Export {
        pack: PathBuf,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &MempackError) -> u8 {
    use MempackError::*;
    match e {
        BadMagic { .. } | UnsupportedVersion { .. } | HeaderCorrupt(_) | FooterCorrupt
        | BlockCorrupt(_) | ChunkUnavailable(_) | EccUnrecoverable(_) | DecompressError(_)
        | AnnCorrupt(_) => EXIT_CORRUPT,
        InvalidConfig(_) => EXIT_USAGE,
        _ => EXIT_GENERIC,
    }
}

fn run(cli: Cli) -> Result<ExitCode, MempackError> {
    match cli.command {
        // ── Build ────────────────────────────────────────────────────────
        Commands::Build {
            output,
            codec,
            level,
            chunk_size,
            chunk_overlap,
            block_size,
            ecc,
            dim,
            tag,
            input,
        } => {
            let compressor = Compressor::from_name(&codec).ok_or_else(|| {
                MempackError::InvalidConfig(format!("unknown codec '{codec}'"))
            })?;
            let config = PackConfig {
                compressor,
                compression_level: level,
                chunk_size,
                chunk_overlap,
                block_size: block_size * 1024,
                ecc,
                ..PackConfig::default()
            };

            let mut docs = Vec::with_capacity(input.len());
            for path in &input {
                let text = std::fs::read_to_string(path)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let mut doc = Document::new(name, text);
                doc.tags.extend(tag.iter().cloned());
                docs.push(doc);
            }

            let backend = HashingEmbedder::new(dim);
            let (pack_path, ann_path) = pack_paths(&output);
            let stats = build(&docs, &backend, &config, &pack_path, &ann_path)?;
            println!(
                "Created: {} + {}  ({} docs, {} chunks, {} blocks, {} B packed, {:.1}% of text)",
                pack_path.display(),
                ann_path.display(),
                stats.documents,
                stats.chunks,
                stats.blocks,
                stats.packed_bytes,
                stats.ratio() * 100.0,
            );
            Ok(ExitCode::SUCCESS)
        }

        // ── Search ───────────────────────────────────────────────────────
        Commands::Search { pack, query, top_k, ef, filter, tag, full } => {
            let retriever = open_retriever(&pack)?;
            let opts = SearchOptions {
                ef_search: ef,
                filter_meta: if filter.is_empty() {
                    None
                } else {
                    Some(filter.into_iter().collect::<BTreeMap<_, _>>())
                },
                filter_tags: tag,
                deadline: None,
            };
            let hits = retriever.search(&query, top_k, &opts)?;
            if hits.is_empty() {
                println!("no hits");
            }
            for (rank, hit) in hits.iter().enumerate() {
                let source = hit
                    .meta
                    .fields
                    .get("source")
                    .map(|v| v.to_json().to_string())
                    .unwrap_or_else(|| "-".into());
                println!("#{:<3} score={:.4}  chunk={}  source={}", rank + 1, hit.score, hit.chunk_id, source);
                if full {
                    println!("{}", hit.text);
                    println!();
                } else {
                    let preview: String = hit.text.chars().take(100).collect();
                    println!("     {}", preview.replace('\n', " "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Verify ───────────────────────────────────────────────────────
        Commands::Verify { pack } => {
            let (pack_path, ann_path) = pack_paths(&pack);
            let reader = PackReader::open(&pack_path)?;
            let ann = match mempack::AnnReader::open(&ann_path) {
                Ok(a) => Some(a),
                Err(e) => {
                    eprintln!("warning: skipping ANN check: {e}");
                    None
                }
            };
            let report = mempack::verify_pack(&reader, ann.as_ref(), None)?;
            println!("{}", report.summary());
            if let Some(a) = report.ann {
                println!(
                    "ann: {} vector(s) / {} chunk(s) — {}",
                    a.vector_count,
                    a.chunk_count,
                    if a.consistent { "consistent" } else { "MISMATCH" },
                );
            }
            if report.is_healthy() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_CORRUPT))
            }
        }

        // ── Info ─────────────────────────────────────────────────────────
        Commands::Info { pack } => {
            let (pack_path, ann_path) = pack_paths(&pack);
            let reader = PackReader::open(&pack_path)?;
            let info = reader.info();
            let file_size = std::fs::metadata(&pack_path)?.len();

            println!("── .mpack ───────────────────────────────────────────────");
            println!("  Path            {}", pack_path.display());
            println!("  File size       {} B", file_size);
            println!("  Chunks          {}", reader.chunk_count());
            println!("  Blocks          {}", reader.block_count());
            println!("  Codec           {} (level {})", info.config.compressor.name(), info.config.compression_level);
            println!("  Chunking        {} chars, {} overlap", info.config.chunk_size, info.config.chunk_overlap);
            println!("  Block target    {} B", info.config.block_size);
            println!("  Embedding       {} (d={})", info.embedding_backend, info.embedding_dim);
            match &info.config.ecc {
                Some(p) => println!("  ECC             k={}, m={} ({} group(s))", p.k, p.m,
                    reader.ecc().map_or(0, |t| t.groups.len())),
                None => println!("  ECC             disabled"),
            }
            println!("  Sections:");
            for e in &reader.header().table.entries {
                println!(
                    "    {}  offset={:<10} length={}",
                    String::from_utf8_lossy(&e.tag),
                    e.offset,
                    e.length,
                );
            }
            if let Some(tags) = reader.tag_index() {
                let names: Vec<&str> = tags.entries.keys().map(|s| s.as_str()).collect();
                println!("  Tags            {}", names.join(", "));
            }

            match mempack::AnnReader::open(&ann_path) {
                Ok(ann) => {
                    println!("── .ann ─────────────────────────────────────────────────");
                    println!("  Path            {}", ann_path.display());
                    println!("  Vectors         {} (d={})", ann.vector_count(), ann.dim());
                    println!("  HNSW            M={}, efConstruction={}", ann.m(), ann.ef_construction());
                    println!("  Seed            {:#018x}", ann.seed());
                    println!("  Id map          {}", if ann.has_id_map() { "present" } else { "identity" });
                }
                Err(e) => eprintln!("warning: no readable index at {}: {e}", ann_path.display()),
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Export ───────────────────────────────────────────────────────
        Commands::Export { pack, output } => {
            let retriever = open_retriever(&pack)?;
            let mut sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(std::fs::File::create(path)?),
                None => Box::new(std::io::stdout().lock()),
            };
            let mut exported = 0u64;
            for chunk_id in 0..retriever.pack().chunk_count() {
                match retriever.get_chunk(chunk_id, None) {
                    Ok(chunk) => {
                        let line = serde_json::json!({
                            "chunk_id": chunk.chunk_id,
                            "text": chunk.text,
                            "meta": chunk.meta.to_json(),
                            "tags": chunk.meta.tags.iter().collect::<Vec<_>>(),
                        });
                        writeln!(sink, "{line}")?;
                        exported += 1;
                    }
                    Err(MempackError::ChunkUnavailable(id)) => {
                        eprintln!("warning: chunk {id} unavailable, skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            sink.flush()?;
            eprintln!("exported {exported} chunk(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Accept either a base path or the `.mpack` file itself.
fn pack_paths(base: &Path) -> (PathBuf, PathBuf) {
    let stem = if base.extension().is_some_and(|e| e == "mpack") {
        base.with_extension("")
    } else {
        base.to_owned()
    };
    (stem.with_extension("mpack"), stem.with_extension("ann"))
}

fn open_retriever(base: &Path) -> Result<Retriever, MempackError> {
    let (pack_path, ann_path) = pack_paths(base);
    let probe = PackReader::open(&pack_path)?;
    let dim = probe.info().embedding_dim;
    drop(probe);
    Retriever::open(&pack_path, &ann_path, Arc::new(HashingEmbedder::new(dim)))
}

fn parse_ecc(s: &str) -> Result<EccParams, String> {
    let (k, m) = s
        .split_once(',')
        .ok_or_else(|| format!("expected k,m — got '{s}'"))?;
    let k = k.trim().parse::<u16>().map_err(|e| e.to_string())?;
    let m = m.trim().parse::<u16>().map_err(|e| e.to_string())?;
    Ok(EccParams { k, m })
}

fn parse_filter(s: &str) -> Result<(String, MetaValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value — got '{s}'"))?;
    Ok((key.to_owned(), MetaValue::parse(value)))
}
