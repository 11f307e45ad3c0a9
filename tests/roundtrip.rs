//! Serialize an emitted patch object and read it back, checking the
//! link conventions the runtime loader depends on.

mod common;

use common::*;

use xsplice_build::elf::reloc::R_X86_64_PLT32;
use xsplice_build::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FILE};
use xsplice_build::funcs::SIZEOF_PATCH_FUNC;
use xsplice_build::model::{Object, Symbol};
use xsplice_build::{Options, build_patch, read, write};

const RET: &[u8] = &[0xf3, 0xc3];

fn sample(foo_code: &[u8], baz_code: &[u8]) -> Object {
    let mut b = Builder::new();
    b.file_symbol("dir.c");
    let (foo_sec, _) = b.func("foo", STB_GLOBAL, foo_code);
    let (_, bar_sym) = b.func("bar", STB_GLOBAL, RET);
    b.func("baz", STB_LOCAL, baz_code);
    let rela = b.rela_section(foo_sec);
    b.reloc(rela, 1, R_X86_64_PLT32, bar_sym, -4);
    b.standard_tables();
    b.finish()
}

fn bucket(sym: &Symbol) -> usize {
    if sym.name.is_empty() && sym.sym.st_info == 0 {
        0
    } else if sym.typ() == STT_FILE {
        1
    } else if sym.is_local() && sym.is_func() {
        2
    } else if sym.is_local() {
        3
    } else {
        4
    }
}

#[test]
fn emitted_object_reparses_with_link_conventions() {
    let base = sample(&[0x31, 0xc0, 0xc3], RET);
    let patched = sample(&[0x31, 0xc9, 0xc3], &[0x90, 0xc3]);
    let tbl = table(vec![
        file_entry("dir.c"),
        local_func_entry("baz", 0xffff_8000_0000_5000, 0x20),
        global_func_entry("foo", 0xffff_8000_0000_1000, 0x40),
        global_func_entry("bar", 0xffff_8000_0000_2000, 0x40),
    ]);
    let mut out = build_patch(base, patched, &tbl, &Options::default()).unwrap();
    let bytes = write::write_object(&mut out).unwrap();
    let reread = read::parse(&bytes).unwrap();

    // the null symbol leads, and the buckets never run backwards
    assert_eq!(reread.symbols[0].name, "");
    assert_eq!(reread.symbols[0].sym.st_info, 0);
    let buckets: Vec<usize> = reread.symbols.iter().map(bucket).collect();
    assert!(buckets.windows(2).all(|w| w[0] <= w[1]), "{buckets:?}");

    // both changed functions made the table; the local one is scoped
    let funcs = reread.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(
        reread.sections[funcs].data.as_ref().unwrap().len(),
        2 * SIZEOF_PATCH_FUNC
    );
    assert_eq!(
        reread.sections[funcs].shdr.sh_entsize as usize,
        SIZEOF_PATCH_FUNC
    );
    assert!(reread.sections[funcs].rela.is_some());
    assert!(reread.symbol_by_name("dir.c#baz").is_some());

    // every relocation section links back to the symbol table
    let symtab = reread.section_by_name(".symtab").unwrap();
    let symtab_index = reread.sections[symtab].index as u32;
    let mut rela_sections = 0;
    for sec in &reread.sections {
        if sec.is_rela() {
            assert_eq!(sec.shdr.sh_link, symtab_index, "{}", sec.name);
            rela_sections += 1;
        }
    }
    assert!(rela_sections >= 2);

    // the string pool holds both names, NUL-terminated in order
    let strings = reread.section_by_name(".xsplice.strings").unwrap();
    let pool = reread.sections[strings].data.as_ref().unwrap();
    let mut names: Vec<&[u8]> = pool.split(|&b| b == 0).filter(|s| !s.is_empty()).collect();
    names.sort();
    assert_eq!(names, vec![&b"dir.c#baz"[..], &b"foo"[..]]);
}

#[test]
fn reread_relocations_resolve_to_the_same_symbols() {
    let base = sample(&[0x31, 0xc0, 0xc3], RET);
    let patched = sample(&[0x31, 0xc9, 0xc3], RET);
    let tbl = table(vec![
        file_entry("dir.c"),
        global_func_entry("foo", 0xffff_8000_0000_1000, 0x40),
    ]);
    let mut out = build_patch(base, patched, &tbl, &Options::default()).unwrap();
    let bytes = write::write_object(&mut out).unwrap();
    let reread = read::parse(&bytes).unwrap();

    let rela = reread.section_by_name(".rela.text.foo").unwrap();
    assert_eq!(reread.sections[rela].relas.len(), 1);
    let target = reread.sections[rela].relas[0].sym;
    assert_eq!(reread.symbols[target].name, "bar");
    assert_eq!(reread.sections[rela].relas[0].addend, -4);

    // the patch table's new_addr relocation targets the patched body
    let funcs_rela = reread.section_by_name(".rela.xsplice.funcs").unwrap();
    let first = &reread.sections[funcs_rela].relas[0];
    assert_eq!(first.offset, 8);
    assert_eq!(reread.symbols[first.sym].name, "foo");
}
