//! Object-level differencing engine for xSplice live patches.
//!
//! Given two relocatable objects compiled from adjacent revisions of the
//! same source, a **base** and a **patched** variant, the engine
//! computes a third relocatable object holding exactly the functions and
//! supporting data that changed, together with a `.xsplice.funcs` table
//! telling the runtime which functions of the running image to redirect.
//!
//! The pipeline is a linear sequence of passes over a mutable in-memory
//! model: correlate the two inputs ([`correlate`]), classify every
//! element as same/changed/new ([`compare`]), pull in the minimal
//! transitive closure needed to link the patch ([`include`]), regenerate
//! the architecture's metadata tables at group granularity ([`special`]),
//! emit the patch-function table ([`funcs`]), and migrate the survivors
//! into an output object that is serialized last ([`migrate`],
//! [`write`]).

use std::fs;
use std::path::Path;

use log::{debug, info};

pub mod compare;
pub mod correlate;
pub mod elf;
pub mod error;
pub mod funcs;
pub mod include;
pub mod insn;
pub mod lookup;
pub mod migrate;
pub mod model;
pub mod read;
pub mod special;
pub mod write;

pub use crate::error::{Error, Result};
use crate::lookup::Table;
use crate::model::Object;

/// Knobs surfaced on the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Prefill each record's `old_addr` from the lookup table instead of
    /// leaving resolution to the target runtime.
    pub resolve: bool,
}

/// Diff two loaded objects into the output patch object.
///
/// The base object is consumed: it only lives until comparison has
/// settled every status, after which the patched object carries the
/// result through inclusion and migration.
pub fn build_patch(
    mut base: Object,
    mut patched: Object,
    table: &Table,
    opts: &Options,
) -> Result<Object> {
    correlate::check_compat(&base, &patched)?;
    correlate::canonicalize_section_symbols(&mut base)?;
    correlate::canonicalize_section_symbols(&mut patched)?;
    correlate::rename_mangled_functions(&base, &mut patched);
    correlate::correlate_sections(&mut base, &mut patched);
    correlate::correlate_symbols(&mut base, &mut patched);
    correlate::correlate_static_locals(&mut base, &mut patched)?;

    compare::mark_ignored_sections(&mut patched)?;
    compare::compare_correlated_elements(&mut base, &mut patched)?;
    compare::mark_ignored_sections_same(&mut patched);
    compare::mark_ignored_functions_same(&mut patched)?;
    compare::mark_constant_labels_same(&mut patched);
    drop(base);

    include::include_standard_elements(&mut patched);
    let changed = include::include_changed_functions(&mut patched);
    if changed == 0 {
        info!("no changed functions were found");
        return Err(Error::NoChanges);
    }
    debug!("{changed} changed function(s)");
    include::include_new_globals(&mut patched);
    include::include_debug_sections(&mut patched);
    include::include_hook_elements(&mut patched)?;
    special::process_special_sections(&mut patched)?;
    include::verify_patchability(&patched)?;

    funcs::create_patch_table(&mut patched, table, opts.resolve)?;

    let mut out = migrate::migrate_included_elements(&mut patched)?;
    migrate::reorder_symbols(&mut out);
    migrate::reindex(&mut out)?;
    Ok(out)
}

/// File-level entry point: load, diff, serialize. The output file is
/// only written once every fallible pass has succeeded.
pub fn run(
    original: &Path,
    patched: &Path,
    image: &Path,
    output: &Path,
    opts: &Options,
) -> Result<()> {
    let base_bytes = fs::read(original)?;
    let patched_bytes = fs::read(patched)?;
    let base = read::parse(&base_bytes)?;
    let patched = read::parse(&patched_bytes)?;
    let table = Table::open(image)?;
    let mut out = build_patch(base, patched, &table, opts)?;
    let bytes = write::write_object(&mut out)?;
    fs::write(output, bytes)?;
    info!("wrote {}", output.display());
    Ok(())
}
