//! End-to-end differencing scenarios over synthetic objects.

mod common;

use common::*;

use xsplice_build::elf::reloc::{R_X86_64_64, R_X86_64_PC32, R_X86_64_32S, R_X86_64_PLT32};
use xsplice_build::elf::section_header::{SHF_ALLOC, SHN_UNDEF, SHT_PROGBITS};
use xsplice_build::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_OBJECT, STT_SECTION};
use xsplice_build::funcs::SIZEOF_PATCH_FUNC;
use xsplice_build::model::{Object, Status};
use xsplice_build::{Error, Options, build_patch, compare, correlate};

const RET: &[u8] = &[0xf3, 0xc3];
const FOO_V1: &[u8] = &[0x31, 0xc0, 0xc3];
const FOO_V2: &[u8] = &[0x31, 0xc9, 0xc3];

fn two_funcs(foo_code: &[u8]) -> Object {
    let mut b = Builder::new();
    b.file_symbol("dir.c");
    b.func("foo", STB_GLOBAL, foo_code);
    b.func("bar", STB_GLOBAL, RET);
    b.standard_tables();
    b.finish()
}

#[test]
fn identical_inputs_are_an_empty_diff() {
    let base = two_funcs(FOO_V1);
    let patched = two_funcs(FOO_V1);
    let err = build_patch(base, patched, &table(vec![]), &Options::default()).unwrap_err();
    assert!(matches!(err, Error::NoChanges));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn single_function_change() {
    let base = two_funcs(FOO_V1);
    let patched = two_funcs(FOO_V2);
    let tbl = table(vec![
        global_func_entry("foo", 0xffff_8000_0000_1000, 0x40),
        global_func_entry("bar", 0xffff_8000_0000_2000, 0x40),
    ]);
    let out = build_patch(base, patched, &tbl, &Options::default()).unwrap();

    assert!(out.section_by_name(".text.foo").is_some());
    assert!(out.section_by_name(".text.bar").is_none());

    let funcs = out.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(
        out.sections[funcs].shdr.sh_entsize as usize,
        SIZEOF_PATCH_FUNC
    );
    let data = out.sections[funcs].data.as_ref().unwrap();
    assert_eq!(data.len(), SIZEOF_PATCH_FUNC);
    assert_eq!(u64_at(data, 0), 0); // old_addr left for the runtime
    assert_eq!(u32_at(data, 16), 0x40); // old_size from the image
    assert_eq!(u32_at(data, 20), FOO_V2.len() as u32); // new_size

    let rela = out.sections[funcs].rela.unwrap();
    let relas = &out.sections[rela].relas;
    assert_eq!(relas.len(), 2);
    assert_eq!(relas[0].offset, 8);
    assert_eq!(relas[0].rtype, R_X86_64_64);
    assert_eq!(out.symbols[relas[0].sym].name, "foo");
    assert_eq!(relas[1].offset, 24);
    assert_eq!(relas[1].rtype, R_X86_64_64);
    assert_eq!(out.symbols[relas[1].sym].name, ".xsplice.strings");
    assert_eq!(relas[1].addend, 0);

    let strings = out.section_by_name(".xsplice.strings").unwrap();
    assert_eq!(out.sections[strings].data.as_deref(), Some(&b"foo\0"[..]));
}

#[test]
fn resolve_prefills_old_addresses() {
    let base = two_funcs(FOO_V1);
    let patched = two_funcs(FOO_V2);
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(base, patched, &tbl, &Options { resolve: true }).unwrap();
    let funcs = out.section_by_name(".xsplice.funcs").unwrap();
    let data = out.sections[funcs].data.as_ref().unwrap();
    assert_eq!(u64_at(data, 0), 0xffff_8000_0000_1000);
}

#[test]
fn local_functions_are_scoped_by_file_hint() {
    let build = |code: &[u8]| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_LOCAL, code);
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![
        file_entry("dir.c"),
        local_func_entry("foo", 0xffff_8000_0000_3000, 0x30),
    ]);
    let out = build_patch(build(FOO_V1), build(FOO_V2), &tbl, &Options::default()).unwrap();

    let strings = out.section_by_name(".xsplice.strings").unwrap();
    assert_eq!(
        out.sections[strings].data.as_deref(),
        Some(&b"dir.c#foo\0"[..])
    );
    // the surviving local function is renamed the same way
    assert!(out.symbol_by_name("dir.c#foo").is_some());
    assert!(out.symbol_by_name("foo").is_none());
}

#[test]
fn missing_lookup_entry_is_fatal() {
    let base = two_funcs(FOO_V1);
    let patched = two_funcs(FOO_V2);
    let err = build_patch(base, patched, &table(vec![]), &Options::default()).unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[test]
fn undersized_patch_target_is_fatal() {
    let base = two_funcs(FOO_V1);
    let patched = two_funcs(FOO_V2);
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 4)]);
    let err = build_patch(base, patched, &tbl, &Options::default()).unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[test]
fn mangled_function_rename_yields_empty_diff() {
    let build = |name: &str| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func(name, STB_LOCAL, FOO_V1);
        b.standard_tables();
        b.finish()
    };
    let base = build("sysctl_print_dir.isra.1");
    let patched = build("sysctl_print_dir.isra.2");
    let err = build_patch(base, patched, &table(vec![]), &Options::default()).unwrap_err();
    assert!(matches!(err, Error::NoChanges));
}

#[test]
fn static_local_is_renamed_and_shared() {
    let build = |tick_code: &[u8], counter: &str| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        let (tick_sec, _) = b.func("tick", STB_GLOBAL, tick_code);
        let (_, counter_sym) = b.data_object(counter, STB_LOCAL, &[0u8; 8]);
        let rela = b.rela_section(tick_sec);
        b.reloc(rela, 2, R_X86_64_32S, counter_sym, 0);
        b.standard_tables();
        b.finish()
    };
    let base = build(FOO_V1, "counter.7");
    let patched = build(FOO_V2, "counter.9");
    let tbl = table(vec![global_func_entry("tick", 0xffff_8000_0000_4000, 0x40)]);
    let out = build_patch(base, patched, &tbl, &Options::default()).unwrap();

    // only tick is patched; the static keeps its base identity and is
    // resolved against the running image at load time
    assert!(out.section_by_name(".data.counter.7").is_none());
    assert!(out.section_by_name(".data.counter.9").is_none());
    let counter = out.symbol_by_name("dir.c#counter.7").unwrap();
    assert_eq!(out.symbols[counter].sym.st_shndx, SHN_UNDEF);
    let funcs = out.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(
        out.sections[funcs].data.as_ref().unwrap().len(),
        SIZEOF_PATCH_FUNC
    );
    // the relocation in tick's body now points at the renamed symbol
    let tick_rela = out.section_by_name(".rela.text.tick").unwrap();
    assert_eq!(
        out.symbols[out.sections[tick_rela].relas[0].sym].name,
        "dir.c#counter.7"
    );
}

#[test]
fn ignored_function_is_forced_out_of_the_diff() {
    let build = |foo: &[u8], bar: &[u8], with_directive: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        let (_, bar_sym) = b.func("bar", STB_GLOBAL, bar);
        if with_directive {
            let dir = b.section(".xsplice.ignore.functions", SHT_PROGBITS, 0, 8, vec![0; 8]);
            let rela = b.rela_section(dir);
            b.reloc(rela, 0, R_X86_64_64, bar_sym, 0);
        }
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);

    // bar changed too, but the directive forces it back out
    let base = build(FOO_V1, RET, false);
    let patched = build(FOO_V2, &[0x90, 0xc3], true);
    let out = build_patch(base, patched, &tbl, &Options::default()).unwrap();
    assert!(out.section_by_name(".text.bar").is_none());
    assert!(out.section_by_name(".xsplice.ignore.functions").is_none());
    let funcs = out.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(
        out.sections[funcs].data.as_ref().unwrap().len(),
        SIZEOF_PATCH_FUNC
    );
}

#[test]
fn unnecessary_ignore_directive_changes_nothing() {
    let build = |foo: &[u8], with_directive: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        let (_, bar_sym) = b.func("bar", STB_GLOBAL, RET);
        if with_directive {
            let dir = b.section(".xsplice.ignore.functions", SHT_PROGBITS, 0, 8, vec![0; 8]);
            let rela = b.rela_section(dir);
            b.reloc(rela, 0, R_X86_64_64, bar_sym, 0);
        }
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);

    let with = build_patch(
        build(FOO_V2, true),
        build(FOO_V2, true),
        &tbl,
        &Options::default(),
    );
    // bar is unchanged either way, so the directive only costs a warning
    assert!(matches!(with.unwrap_err(), Error::NoChanges));

    let without = build_patch(build(FOO_V1, false), build(FOO_V2, false), &tbl, &Options::default())
        .unwrap();
    let with = build_patch(build(FOO_V1, true), build(FOO_V2, true), &tbl, &Options::default())
        .unwrap();
    let names = |obj: &Object| obj.sections.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&without), names(&with));
}

#[test]
fn changed_unincluded_section_is_unsupported() {
    let build = |foo: &[u8], tbl_byte: u8| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        b.section(".rodata.tbl", SHT_PROGBITS, SHF_ALLOC, 8, vec![tbl_byte; 8]);
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let err = build_patch(build(FOO_V1, 0), build(FOO_V2, 1), &tbl, &Options::default())
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn ignore_sections_directive_forces_same() {
    let build = |foo: &[u8], tbl_byte: u8, with_directive: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        b.section(".rodata.tbl", SHT_PROGBITS, SHF_ALLOC, 8, vec![tbl_byte; 8]);
        if with_directive {
            let strsec = b.section(
                ".rodata.str1.1",
                SHT_PROGBITS,
                SHF_ALLOC,
                1,
                b".rodata.tbl\0".to_vec(),
            );
            let strsym = b.obj.add_section_symbol(strsec);
            let dir = b.section(".xsplice.ignore.sections", SHT_PROGBITS, 0, 8, vec![0; 8]);
            let rela = b.rela_section(dir);
            b.reloc(rela, 0, R_X86_64_64, strsym, 0);
        }
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let base = build(FOO_V1, 0, false);
    let patched = build(FOO_V2, 1, true);
    let out = build_patch(base, patched, &tbl, &Options::default()).unwrap();
    // the perturbed table stays behind, the authoring literal rides along
    assert!(out.section_by_name(".rodata.tbl").is_none());
    assert!(out.section_by_name(".rodata.str1.1").is_some());
    assert!(out.section_by_name(".xsplice.ignore.sections").is_none());
}

#[test]
fn symbol_crossing_into_ignored_section_is_tolerated() {
    let build = |foo: &[u8], crossed: bool, with_directive: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        let tbl_sec = b.section(".rodata.tbl", SHT_PROGBITS, SHF_ALLOC, 8, vec![0; 16]);
        let old_sec = b.section(".rodata.old", SHT_PROGBITS, SHF_ALLOC, 8, vec![0; 16]);
        let home = if crossed { tbl_sec } else { old_sec };
        b.symbol("state", STB_LOCAL, STT_OBJECT, home, 8);
        if with_directive {
            let strsec = b.section(
                ".rodata.str1.1",
                SHT_PROGBITS,
                SHF_ALLOC,
                1,
                b".rodata.tbl\0".to_vec(),
            );
            let strsym = b.obj.add_section_symbol(strsec);
            let dir = b.section(".xsplice.ignore.sections", SHT_PROGBITS, 0, 8, vec![0; 8]);
            let rela = b.rela_section(dir);
            b.reloc(rela, 0, R_X86_64_64, strsym, 0);
        }
        b.standard_tables();
        b.finish()
    };

    // the comparator tolerates the crossing and marks the symbol CHANGED
    let mut base = build(FOO_V1, false, false);
    let mut patched = build(FOO_V2, true, true);
    correlate::correlate_sections(&mut base, &mut patched);
    correlate::correlate_symbols(&mut base, &mut patched);
    compare::mark_ignored_sections(&mut patched).unwrap();
    compare::compare_correlated_elements(&mut base, &mut patched).unwrap();
    let state = patched.symbol_by_name("state").unwrap();
    assert_eq!(patched.symbols[state].status, Status::Changed);

    // without the directive the same crossing is an unsupported diff
    let err = build_patch(
        build(FOO_V1, false, false),
        build(FOO_V2, true, false),
        &table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]),
        &Options::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));

    // with it the full pipeline produces a patch
    let image = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(
        build(FOO_V1, false, false),
        build(FOO_V2, true, true),
        &image,
        &Options::default(),
    )
    .unwrap();
    assert!(out.section_by_name(".rodata.tbl").is_none());
    assert!(out.section_by_name(".text.foo").is_some());
}

#[test]
fn new_global_functions_ride_along() {
    let build = |foo: &[u8], with_new: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        if with_new {
            b.func("newfn", STB_GLOBAL, RET);
        }
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(
        build(FOO_V1, false),
        build(FOO_V2, true),
        &tbl,
        &Options::default(),
    )
    .unwrap();
    assert!(out.section_by_name(".text.newfn").is_some());
    // only changed functions get table entries
    let funcs = out.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(
        out.sections[funcs].data.as_ref().unwrap().len(),
        SIZEOF_PATCH_FUNC
    );
}

#[test]
fn closure_stops_at_unchanged_targets() {
    let build = |foo: &[u8]| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        let (foo_sec, _) = b.func("foo", STB_GLOBAL, foo);
        let (_, bar_sym) = b.func("bar", STB_GLOBAL, RET);
        let rela = b.rela_section(foo_sec);
        b.reloc(rela, 1, R_X86_64_PLT32, bar_sym, -4);
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(build(FOO_V1), build(FOO_V2), &tbl, &Options::default()).unwrap();

    // bar's symbol survives as the relocation target, but its body does
    // not travel with the patch
    assert!(out.section_by_name(".text.foo").is_some());
    assert!(out.section_by_name(".rela.text.foo").is_some());
    assert!(out.section_by_name(".text.bar").is_none());
    let bar = out.symbol_by_name("bar").unwrap();
    assert_eq!(out.symbols[bar].sym.st_shndx, SHN_UNDEF);
}

#[test]
fn hook_routines_are_carried_but_not_exported() {
    let build = |foo: &[u8], with_hook: bool| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        if with_hook {
            let (_, hook_sym) = b.func("load_hook", STB_LOCAL, &[0x90, 0xc3]);
            let hooks = b.section(".xsplice.hooks.load", SHT_PROGBITS, SHF_ALLOC, 8, vec![0; 8]);
            b.obj.add_section_symbol(hooks);
            let rela = b.rela_section(hooks);
            b.reloc(rela, 0, R_X86_64_64, hook_sym, 0);
        }
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(
        build(FOO_V1, false),
        build(FOO_V2, true),
        &tbl,
        &Options::default(),
    )
    .unwrap();

    assert!(out.section_by_name(".xsplice.hooks.load").is_some());
    assert!(out.section_by_name(".text.load_hook").is_some());
    // the routine's own symbol is detached; the relocation goes through
    // the section symbol
    assert!(out.symbol_by_name("load_hook").is_none());
    let rela = out.section_by_name(".rela.xsplice.hooks.load").unwrap();
    let target = out.sections[rela].relas[0].sym;
    assert_eq!(out.symbols[target].name, ".text.load_hook");
    assert_eq!(out.symbols[target].typ(), STT_SECTION);
}

#[test]
fn ex_table_groups_are_compacted() {
    let build = |foo: &[u8]| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        let (_, foo_sym) = b.func("foo", STB_GLOBAL, foo);
        let (_, bar_sym) = b.func("bar", STB_GLOBAL, RET);
        let ex = b.section(
            ".ex_table",
            SHT_PROGBITS,
            SHF_ALLOC,
            8,
            (0u8..16).collect(),
        );
        b.obj.add_section_symbol(ex);
        let rela = b.rela_section(ex);
        b.reloc(rela, 0, R_X86_64_PC32, foo_sym, 0);
        b.reloc(rela, 8, R_X86_64_PC32, bar_sym, 0);
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(build(FOO_V1), build(FOO_V2), &tbl, &Options::default()).unwrap();

    // only the group whose relocation lands in patched code survives
    let ex = out.section_by_name(".ex_table").unwrap();
    assert_eq!(
        out.sections[ex].data.as_deref(),
        Some(&[0u8, 1, 2, 3, 4, 5, 6, 7][..])
    );
    assert_eq!(out.sections[ex].shdr.sh_size, 8);
    let rela = out.sections[ex].rela.unwrap();
    assert_eq!(out.sections[rela].relas.len(), 1);
    assert_eq!(out.sections[rela].relas[0].offset, 0);
    assert_eq!(out.symbols[out.sections[rela].relas[0].sym].name, "foo");
}

#[test]
fn untouched_ex_table_is_dropped() {
    let build = |foo: &[u8]| {
        let mut b = Builder::new();
        b.file_symbol("dir.c");
        b.func("foo", STB_GLOBAL, foo);
        let (_, bar_sym) = b.func("bar", STB_GLOBAL, RET);
        let ex = b.section(".ex_table", SHT_PROGBITS, SHF_ALLOC, 8, (0u8..8).collect());
        b.obj.add_section_symbol(ex);
        let rela = b.rela_section(ex);
        b.reloc(rela, 0, R_X86_64_PC32, bar_sym, 0);
        b.standard_tables();
        b.finish()
    };
    let tbl = table(vec![global_func_entry("foo", 0xffff_8000_0000_1000, 0x40)]);
    let out = build_patch(build(FOO_V1), build(FOO_V2), &tbl, &Options::default()).unwrap();
    assert!(out.section_by_name(".ex_table").is_none());
    assert!(out.section_by_name(".rela.ex_table").is_none());
}

#[test]
fn correlation_is_symmetric() {
    let mut base = two_funcs(FOO_V1);
    let mut patched = two_funcs(FOO_V2);
    correlate::correlate_sections(&mut base, &mut patched);
    correlate::correlate_symbols(&mut base, &mut patched);

    for (id, sec) in patched.sections.iter().enumerate() {
        let twin = sec.twin.unwrap();
        assert_eq!(base.sections[twin].twin, Some(id));
    }
    for (id, sym) in patched.symbols.iter().enumerate() {
        let twin = sym.twin.unwrap();
        assert_eq!(base.symbols[twin].twin, Some(id));
    }
}

#[test]
fn section_symbol_relocations_are_canonicalized() {
    let mut b = Builder::new();
    // call rel32 at offset 0, then ret: the relocation at offset 1 sits
    // inside a five-byte instruction
    let (foo_sec, _) = b.func("foo", STB_GLOBAL, &[0xe8, 0, 0, 0, 0, 0xc3]);
    let rodata = b.section(".rodata", SHT_PROGBITS, SHF_ALLOC, 8, vec![0; 16]);
    let rodata_sym = b.obj.add_section_symbol(rodata);
    let g = b.symbol("g", STB_LOCAL, STT_OBJECT, rodata, 4);
    b.obj.symbols[g].sym.st_value = 4;
    let rela = b.rela_section(foo_sec);
    b.reloc(rela, 1, R_X86_64_PC32, rodata_sym, 3);
    let mut obj = b.finish();

    correlate::canonicalize_section_symbols(&mut obj).unwrap();
    let rewritten = &obj.sections[rela].relas[0];
    // effective offset 3 + 4 = 7 lands inside g's [4, 8) range
    assert_eq!(obj.symbols[rewritten.sym].name, "g");
    assert_eq!(rewritten.addend, -1);
}

#[test]
fn bundled_targets_win_canonicalization() {
    let mut b = Builder::new();
    let (foo_sec, _) = b.func("foo", STB_GLOBAL, &[0xe8, 0, 0, 0, 0, 0xc3]);
    let (bar_sec, _) = b.func("bar", STB_GLOBAL, RET);
    let bar_secsym = b.obj.sections[bar_sec].secsym.unwrap();
    let rela = b.rela_section(foo_sec);
    b.reloc(rela, 1, R_X86_64_PC32, bar_secsym, -4);
    let mut obj = b.finish();

    correlate::canonicalize_section_symbols(&mut obj).unwrap();
    let rewritten = &obj.sections[rela].relas[0];
    assert_eq!(obj.symbols[rewritten.sym].name, "bar");
    assert_eq!(rewritten.addend, -4);
}
