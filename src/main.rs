// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command line front-end for the AArch64 function lifter and patchbay
//! engine. The CLI is flag-based rather than subcommand-based: a single
//! `--mode` flag routes between coverage analysis, bundle export, and the
//! full protect pipeline.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use capstone::prelude::*;
use clap::{Arg, Command};
use log::{info, warn, LevelFilter};

use aarch64_vm_protect::bundle::{write_expanded_so, SoBinPayload};
use aarch64_vm_protect::elf::ElfImage;
use aarch64_vm_protect::embed;
use aarch64_vm_protect::function::dump::{self, DumpMode};
use aarch64_vm_protect::function::{is_supported_mnemonic, LiftedFunction};
use aarch64_vm_protect::patchbay::{apply_aliases, AliasPair};
use aarch64_vm_protect::pht::relocate_and_expand_pht;
use aarch64_vm_protect::{Result, VmpError};

/// Functions protected when the caller passes neither `--function` nor
/// `--analyze-all`. Mirrors the demo library's own exported function set.
const DEFAULT_FUNCTIONS: &[&str] = &[
    "fun_for",
    "fun_add",
    "fun_for_add",
    "fun_if_sub",
    "fun_countdown_muladd",
    "fun_loop_call_mix",
    "fun_call_chain",
    "fun_branch_call",
    "fun_cpp_make_string",
    "fun_cpp_string_len",
    "fun_cpp_vector_sum",
    "fun_cpp_virtual_mix",
    "fun_global_data_mix",
    "fun_static_local_table",
    "fun_global_struct_acc",
    "fun_class_static_member",
    "fun_multi_branch_path",
    "fun_switch_dispatch",
    "fun_bitmask_branch",
    "fun_global_table_rw",
    "fun_global_mutable_state",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineMode {
    Coverage,
    Export,
    Protect,
}

impl PipelineMode {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "coverage" => Ok(Self::Coverage),
            "export" => Ok(Self::Export),
            "protect" => Ok(Self::Protect),
            other => Err(VmpError::CliBadArgument(format!(
                "invalid --mode value: {other} (expected: coverage|export|protect)"
            ))),
        }
    }
}

/// Fully resolved run configuration: CLI overrides already applied on top of
/// the defaults.
struct PipelineConfig {
    input_so: PathBuf,
    output_dir: PathBuf,
    expanded_so: String,
    shared_branch_file: String,
    coverage_report: String,
    functions: Vec<String>,
    analyze_all_functions: bool,
    mode: PipelineMode,
    vmengine_so: Option<PathBuf>,
    output_so: Option<PathBuf>,
    patch_origin_so: Option<PathBuf>,
    patch_impl_symbol: String,
    patch_all_exports: bool,
    patch_allow_validate_fail: bool,
    describe_layout: bool,
}

impl PipelineConfig {
    fn join_output(&self, file_name: &str) -> PathBuf {
        let p = Path::new(file_name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.output_dir.join(p)
        }
    }
}

fn build_cli() -> Command<'static> {
    Command::new("vmprotect")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lifts AArch64 functions into VM bytecode and patches ELF dynamic exports")
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("input_so")
                .long("input-so")
                .takes_value(true)
                .help("Input arm64 .so path (required)"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(["coverage", "export", "protect"])
                .help("Route mode (default: export)"),
        )
        .arg(
            Arg::new("output_dir")
                .long("output-dir")
                .takes_value(true)
                .help("Output directory for txt/bin/report artifacts (default: .)"),
        )
        .arg(
            Arg::new("expanded_so")
                .long("expanded-so")
                .takes_value(true)
                .help("Expanded .so output file name (default: libdemo_expand.so)"),
        )
        .arg(
            Arg::new("shared_branch_file")
                .long("shared-branch-file")
                .takes_value(true)
                .help("Shared branch list output file name (default: branch_addr_list.txt)"),
        )
        .arg(
            Arg::new("coverage_report")
                .long("coverage-report")
                .takes_value(true)
                .help("Coverage report output file name (default: coverage_report.md)"),
        )
        .arg(
            Arg::new("function")
                .long("function")
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Protected function symbol (repeatable, required in protect route)"),
        )
        .arg(
            Arg::new("analyze_all")
                .long("analyze-all")
                .help("Analyze all extracted functions"),
        )
        .arg(
            Arg::new("coverage_only")
                .long("coverage-only")
                .help("Legacy alias of --mode coverage"),
        )
        .arg(
            Arg::new("vmengine_so")
                .long("vmengine-so")
                .takes_value(true)
                .help("Vmengine .so path (required in protect route)"),
        )
        .arg(
            Arg::new("output_so")
                .long("output-so")
                .takes_value(true)
                .help("Protected output .so path (required in protect route)"),
        )
        .arg(
            Arg::new("patch_origin_so")
                .long("patch-origin-so")
                .takes_value(true)
                .help("Origin .so whose exports become alias candidates"),
        )
        .arg(
            Arg::new("patch_impl_symbol")
                .long("patch-impl-symbol")
                .takes_value(true)
                .help("Implementation symbol aliases route through (default: vm_takeover_entry_0000)"),
        )
        .arg(
            Arg::new("patch_all_exports")
                .long("patch-all-exports")
                .help("Patch all origin exports (default: only fun_* and Java_*)"),
        )
        .arg(
            Arg::new("patch_allow_validate_fail")
                .long("patch-allow-validate-fail")
                .help("Allow the patch flow to continue when validation fails"),
        )
        .arg(
            Arg::new("describe_layout")
                .long("describe-layout")
                .help("Print --input-so's ELF region layout to stdout, then exit"),
        )
}

fn dedup_keep_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Builds the final [`PipelineConfig`] from parsed CLI flags, replaying the
/// override-precedence rules: `--coverage-only` only forces coverage mode
/// when `--mode` was not given explicitly, and every mode-incompatible
/// combination is rejected up front rather than silently ignored.
fn resolve_config(matches: &clap::ArgMatches) -> Result<PipelineConfig> {
    let input_so = matches
        .value_of("input_so")
        .ok_or_else(|| VmpError::CliBadArgument("--input-so is required".to_string()))?;

    let mode_set = matches.is_present("mode");
    let mut mode = match matches.value_of("mode") {
        Some(v) => PipelineMode::parse(v)?,
        None => PipelineMode::Export,
    };

    let coverage_only = matches.is_present("coverage_only");
    if coverage_only && !mode_set {
        mode = PipelineMode::Coverage;
    }
    if mode_set && coverage_only && mode != PipelineMode::Coverage {
        return Err(VmpError::CliBadArgument(
            "--coverage-only conflicts with an explicit --mode other than coverage".to_string(),
        ));
    }

    let output_dir = PathBuf::from(matches.value_of("output_dir").unwrap_or("."));
    let functions: Vec<String> = dedup_keep_order(
        matches.values_of("function").map(|v| v.map(String::from).collect()).unwrap_or_default(),
    );
    let analyze_all_functions = matches.is_present("analyze_all");

    let vmengine_so = matches.value_of("vmengine_so").map(PathBuf::from);
    let output_so = matches.value_of("output_so").map(PathBuf::from);
    let patch_origin_so = matches.value_of("patch_origin_so").map(PathBuf::from);

    let has_protect_args = vmengine_so.is_some() || output_so.is_some() || patch_origin_so.is_some();
    if (mode == PipelineMode::Coverage || mode == PipelineMode::Export) && has_protect_args {
        return Err(VmpError::CliBadArgument(format!(
            "--vmengine-so/--output-so/--patch-origin-so are not valid in {mode:?} mode"
        )));
    }
    if mode == PipelineMode::Protect {
        if vmengine_so.is_none() {
            return Err(VmpError::CliBadArgument("--vmengine-so is required in protect mode".to_string()));
        }
        if output_so.is_none() {
            return Err(VmpError::CliBadArgument("--output-so is required in protect mode".to_string()));
        }
        if functions.is_empty() {
            return Err(VmpError::CliBadArgument(
                "protect mode requires at least one explicit --function (defaults/--analyze-all are not allowed)"
                    .to_string(),
            ));
        }
    }

    let input_so = PathBuf::from(input_so);
    if !input_so.is_file() {
        return Err(VmpError::CliBadArgument(format!("--input-so does not exist: {}", input_so.display())));
    }
    if let Some(p) = &vmengine_so {
        if !p.is_file() {
            return Err(VmpError::CliBadArgument(format!("--vmengine-so does not exist: {}", p.display())));
        }
    }
    if let Some(p) = &patch_origin_so {
        if !p.is_file() {
            return Err(VmpError::CliBadArgument(format!("--patch-origin-so does not exist: {}", p.display())));
        }
    }
    fs::create_dir_all(&output_dir)?;

    Ok(PipelineConfig {
        input_so,
        output_dir,
        expanded_so: matches.value_of("expanded_so").unwrap_or("libdemo_expand.so").to_string(),
        shared_branch_file: matches
            .value_of("shared_branch_file")
            .unwrap_or("branch_addr_list.txt")
            .to_string(),
        coverage_report: matches.value_of("coverage_report").unwrap_or("coverage_report.md").to_string(),
        functions,
        analyze_all_functions,
        mode,
        vmengine_so,
        output_so,
        patch_origin_so,
        patch_impl_symbol: matches
            .value_of("patch_impl_symbol")
            .unwrap_or("vm_takeover_entry_0000")
            .to_string(),
        patch_all_exports: matches.is_present("patch_all_exports"),
        patch_allow_validate_fail: matches.is_present("patch_allow_validate_fail"),
        describe_layout: matches.is_present("describe_layout"),
    })
}

/// Resolves the function name list to operate on: `--analyze-all` takes
/// every named defined function over the input image; otherwise it's the
/// explicit `--function` list, falling back to [`DEFAULT_FUNCTIONS`].
fn build_function_name_list(config: &PipelineConfig, image: &ElfImage) -> Result<Vec<String>> {
    let names = if config.analyze_all_functions {
        image.defined_function_symbols()?
    } else if !config.functions.is_empty() {
        config.functions.clone()
    } else {
        DEFAULT_FUNCTIONS.iter().map(|s| s.to_string()).collect()
    };
    Ok(dedup_keep_order(names))
}

struct CoverageRow {
    name: String,
    total_insns: u64,
    supported_insns: u64,
    unsupported_insns: u64,
    translate_ok: bool,
    translate_error: String,
}

/// Coverage mode: attempts translation of every named function, tolerating
/// per-function failure, and renders a markdown report with per-function
/// instruction counts plus two crate-wide histograms (one for supported
/// mnemonics, one for unsupported ones). Never aborts on a single bad
/// function — translate errors are pinned to that function's row.
fn run_coverage(config: &PipelineConfig, image: &ElfImage, names: &[String]) -> Result<Vec<CoverageRow>> {
    let cs = Capstone::new()
        .arm64()
        .mode(arch::arm64::ArchMode::Arm)
        .build()
        .map_err(VmpError::Capstone)?;

    let mut rows = Vec::with_capacity(names.len());
    let mut supported_hist: BTreeMap<String, u64> = BTreeMap::new();
    let mut unsupported_hist: BTreeMap<String, u64> = BTreeMap::new();
    let mut total = 0u64;
    let mut total_supported = 0u64;
    let mut total_unsupported = 0u64;

    for name in names {
        let mut row = CoverageRow {
            name: name.clone(),
            total_insns: 0,
            supported_insns: 0,
            unsupported_insns: 0,
            translate_ok: false,
            translate_error: String::new(),
        };

        match image.function_view(name) {
            Ok(view) => {
                let code = view.bytes(image).to_vec();
                if let Ok(insns) = cs.disasm_all(&code, view.file_offset) {
                    for insn in insns.iter() {
                        let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
                        row.total_insns += 1;
                        total += 1;
                        if is_supported_mnemonic(&mnemonic) {
                            row.supported_insns += 1;
                            total_supported += 1;
                            *supported_hist.entry(mnemonic).or_insert(0) += 1;
                        } else {
                            row.unsupported_insns += 1;
                            total_unsupported += 1;
                            *unsupported_hist.entry(mnemonic).or_insert(0) += 1;
                        }
                    }
                }

                let mut lifted = LiftedFunction::new(view);
                match lifted.prepare_translation(&code) {
                    Ok(()) => row.translate_ok = true,
                    Err(e) => row.translate_error = e.to_string().replace('|', "/"),
                }
            }
            Err(e) => row.translate_error = e.to_string().replace('|', "/"),
        }
        rows.push(row);
    }

    let report_path = config.join_output(&config.coverage_report);
    let mut out = String::new();
    out.push_str("# ARM64 Translation Coverage Board\n\n");
    out.push_str("| Metric | Value |\n");
    out.push_str("| --- | ---: |\n");
    out.push_str(&format!("| Total instructions | {total} |\n"));
    out.push_str(&format!("| Supported instructions | {total_supported} |\n"));
    out.push_str(&format!("| Unsupported instructions | {total_unsupported} |\n\n"));

    out.push_str("## Per Function\n\n");
    out.push_str("| Function | Total | Supported | Unsupported | Translation OK | Translation Error |\n");
    out.push_str("| --- | ---: | ---: | ---: | --- | --- |\n");
    for row in &rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.name,
            row.total_insns,
            row.supported_insns,
            row.unsupported_insns,
            if row.translate_ok { "yes" } else { "no" },
            if row.translate_error.is_empty() { "-" } else { &row.translate_error }
        ));
    }
    out.push('\n');

    write_histogram(&mut out, "Unsupported Instructions", &unsupported_hist);
    write_histogram(&mut out, "Supported Instructions", &supported_hist);

    fs::write(&report_path, out)?;
    info!("coverage report written: {}", report_path.display());
    Ok(rows)
}

/// Appends a markdown histogram section sorted by descending count, then
/// ascending name.
fn write_histogram(out: &mut String, title: &str, hist: &BTreeMap<String, u64>) {
    out.push_str(&format!("## {title}\n\n"));
    out.push_str("| Instruction | Count |\n");
    out.push_str("| --- | ---: |\n");
    let mut sorted: Vec<(&String, &u64)> = hist.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (name, count) in sorted {
        out.push_str(&format!("| {name} | {count} |\n"));
    }
    out.push('\n');
}

struct ExportArtifacts {
    payloads: Vec<SoBinPayload>,
    shared_branch_addrs: Vec<u64>,
}

/// Export mode: translates every named function, aborting the whole export
/// if any one of them fails (unlike coverage mode's per-function
/// tolerance), accumulates a single cross-function shared branch-address
/// table, writes per-function `.txt`/`.bin` dumps, and assembles the
/// expanded bundle library.
fn run_export(config: &PipelineConfig, image: &ElfImage, names: &[String]) -> Result<ExportArtifacts> {
    let mut lifted_functions = Vec::with_capacity(names.len());
    for name in names {
        let view = image.function_view(name)?;
        let code = view.bytes(image).to_vec();
        let mut lifted = LiftedFunction::new(view);
        lifted.prepare_translation(&code)?;
        lifted_functions.push(lifted);
    }

    let mut seen = std::collections::HashSet::new();
    let mut shared_branch_addrs = Vec::new();
    for lifted in &lifted_functions {
        for &addr in lifted.shared_branch_addrs()? {
            if seen.insert(addr) {
                shared_branch_addrs.push(addr);
            }
        }
    }
    write_shared_branch_addr_list(&config.join_output(&config.shared_branch_file), &shared_branch_addrs)?;

    let mut payloads = Vec::with_capacity(lifted_functions.len());
    for lifted in &mut lifted_functions {
        lifted.remap_bl_to_shared(&shared_branch_addrs)?;

        let txt_path = config.join_output(&format!("{}.txt", lifted.view.name));
        dump::dump(lifted, image, DumpMode::Unencoded, &txt_path)?;

        let bin_path = config.join_output(&format!("{}.bin", lifted.view.name));
        let encoded = dump::dump(lifted, image, DumpMode::Encoded, &bin_path)?;

        payloads.push(SoBinPayload { fun_addr: lifted.view.file_offset, encoded_bytes: encoded });
    }

    write_expanded_so(&config.input_so, &config.join_output(&config.expanded_so), &payloads, &shared_branch_addrs)?;
    info!(
        "export completed: payload_count={} shared_branch_addr_count={}",
        payloads.len(),
        shared_branch_addrs.len()
    );

    Ok(ExportArtifacts { payloads, shared_branch_addrs })
}

/// Writes the shared branch-address table as compilable C source, matching
/// the format the VM engine's own build expects: a `branch_addr_count`
/// constant and a `branch_addr_list` array (a single placeholder element
/// when empty, since C forbids a zero-length array).
fn write_shared_branch_addr_list(path: &Path, addrs: &[u64]) -> Result<()> {
    let mut out = format!("static const uint64_t branch_addr_count = {};\n", addrs.len());
    if addrs.is_empty() {
        out.push_str("uint64_t branch_addr_list[1] = {};\n");
    } else {
        let joined: Vec<String> = addrs.iter().map(|a| format!("{a:#x}")).collect();
        out.push_str(&format!("uint64_t branch_addr_list[] = {{ {} }};\n", joined.join(", ")));
    }
    fs::write(path, out)?;
    Ok(())
}

/// Protect mode's final stage: grafts alias exports into `config.input_so`
/// per the donor/impl-symbol rules (restricting to `fun_*`/`Java_*` donor
/// exports unless `--patch-all-exports` is set), writes the patched image
/// to `--output-so`, relocates its program header table to make room for
/// future section growth, and embeds the expanded bundle into the vmengine
/// host library.
fn run_protect(config: &PipelineConfig, image: &ElfImage) -> Result<()> {
    let output_so = config.output_so.as_ref().expect("validated by resolve_config");
    let vmengine_so = config.vmengine_so.as_ref().expect("validated by resolve_config");

    let aliases = if let Some(donor_path) = &config.patch_origin_so {
        let donor = ElfImage::load(donor_path)?;
        let donor_names = donor.defined_function_symbols()?;
        let filtered: Vec<String> = donor_names
            .into_iter()
            .filter(|n| config.patch_all_exports || n.starts_with("fun_") || n.starts_with("Java_"))
            .collect();
        if filtered.is_empty() && !config.patch_allow_validate_fail {
            return Err(VmpError::Validate(
                "no eligible donor exports to alias (use --patch-all-exports to widen the filter)".to_string(),
            ));
        }
        filtered
            .into_iter()
            .enumerate()
            .map(|(i, name)| AliasPair { export_name: name, export_key: i as u64 + 1 })
            .collect::<Vec<_>>()
    } else {
        vec![AliasPair { export_name: config.patch_impl_symbol.clone(), export_key: 1 }]
    };

    if aliases.is_empty() {
        return Err(VmpError::Validate("no alias exports to apply".to_string()));
    }

    let patched_bytes = apply_aliases(image, &aliases)?;
    let patched_image = ElfImage::from_bytes(patched_bytes)?;
    let relocated = relocate_and_expand_pht(&patched_image, 1)?;

    // Post-patch structural validation: re-load the final bytes through the
    // same table-bounds checks any downstream consumer would hit, so a
    // layout mistake is caught here rather than at load time on the target.
    if let Err(e) = ElfImage::from_bytes(relocated.clone()) {
        if config.patch_allow_validate_fail {
            warn!("post-patch structural validation failed, continuing anyway: {e}");
        } else {
            return Err(VmpError::Validate(format!("post-patch structural validation failed: {e}")));
        }
    }

    aarch64_vm_protect::io_util::write_atomic(output_so, &relocated)?;
    info!("patched dynamic exports and relocated program header table: {}", output_so.display());

    let expanded_so = config.join_output(&config.expanded_so);
    let embed_out = default_patch_so_path(vmengine_so);
    embed::embed(vmengine_so, &expanded_so, &embed_out)?;
    info!("embedded expanded bundle into vmengine host: {}", embed_out.display());

    Ok(())
}

/// `<stem>_patch.so` next to the host library, or `libvmengine_patch.so`
/// when the host path carries no usable file name.
fn default_patch_so_path(host_so: &Path) -> PathBuf {
    match host_so.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => host_so.with_file_name(format!("{stem}_patch.so")),
        None => host_so.with_file_name("libvmengine_patch.so"),
    }
}

fn run(config: &PipelineConfig) -> Result<()> {
    let image = ElfImage::load(&config.input_so)?;

    if config.describe_layout {
        println!("{}", image.describe_layout());
        return Ok(());
    }

    let names = build_function_name_list(config, &image)?;

    let coverage_rows = run_coverage(config, &image, &names)?;
    if config.mode == PipelineMode::Coverage {
        return Ok(());
    }

    let failed: Vec<&str> = coverage_rows
        .iter()
        .filter(|r| !r.translate_ok)
        .map(|r| r.name.as_str())
        .collect();
    if !failed.is_empty() {
        return Err(VmpError::CollectError(format!(
            "export aborted: {} of {} functions failed translation ({})",
            failed.len(),
            names.len(),
            failed.join(", ")
        )));
    }

    run_export(config, &image, &names)?;
    if config.mode == PipelineMode::Export {
        return Ok(());
    }

    run_protect(config, &image)
}

fn exit_code_for(err: &VmpError) -> i32 {
    match err {
        VmpError::CliUnknownCommand | VmpError::CliBadArgument(_) => 1,
        VmpError::Io(_)
        | VmpError::NotElf
        | VmpError::UnsupportedClass
        | VmpError::UnsupportedEndian
        | VmpError::UnsupportedMachine
        | VmpError::TableOutOfBounds(_)
        | VmpError::SectionNotFound(_)
        | VmpError::SymbolNotFound(_)
        | VmpError::SymbolZeroSize(_)
        | VmpError::UnmappedAddress(_)
        | VmpError::CollectError(_) => 2,
        _ => 3,
    }
}

fn main_impl() -> Result<()> {
    let matches = build_cli().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.as_str()));
    if log_level <= LevelFilter::Info {
        builder.format_timestamp(None).format_level(false).format_target(false);
    }
    builder.init();

    let config = resolve_config(&matches)?;
    run(&config)
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            warn!("vmprotect failed");
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code)
}
