//! End-to-end tests driving the toolchain the way the CLI does: FLE
//! documents on disk in, linked FLE documents on disk out.

use libfle::fle::ObjectKind;
use libfle::fle::RelocKind;
use libfle::fle::SymbolKind;
use libfle::parsing::load_fle;
use libfle::Driver;
use std::path::Path;
use std::path::PathBuf;

fn run_tool(tool: &str, args: &[String]) {
    Driver::from_invocation(tool, args).unwrap().run().unwrap();
}

fn arg(path: &Path) -> String {
    path.to_str().unwrap().to_owned()
}

fn write_fle(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const CALLER: &str = r#"{
    "type": ".obj",
    "shdrs": [
        {"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 6}
    ],
    ".text": [
        "📤: _start 6 0",
        "🔢: e8",
        "❓: .rel(helper - 4)",
        "🔢: c3"
    ]
}"#;

const HELPER: &str = r#"{
    "type": ".obj",
    "shdrs": [
        {"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}
    ],
    ".text": [
        "📤: helper 1 0",
        "🔢: c3"
    ]
}"#;

#[test]
fn test_two_object_link_through_driver() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_fle(dir.path(), "a.fle", CALLER);
    let b = write_fle(dir.path(), "b.fle", HELPER);
    let out = dir.path().join("prog");
    run_tool("ld", &["-o".to_owned(), arg(&out), arg(&a), arg(&b)]);

    let exe = load_fle(&out).unwrap();
    assert_eq!(exe.kind, ObjectKind::Exe);
    assert_eq!(exe.entry, 0x400000);
    let text = &exe.sections[".text"].data;
    assert_eq!(text.len(), 7);
    // helper sits at 0x400006; the displacement field holds S + A - P where
    // P = 0x400001: 0x400006 - 4 - 0x400001 = 1.
    assert_eq!(u32::from_le_bytes(text[1..5].try_into().unwrap()), 1);
    assert_eq!(text[6], 0xc3);
}

#[test]
fn test_archive_selection_through_driver() {
    let dir = tempfile::tempdir().unwrap();
    let fm = write_fle(
        dir.path(),
        "fm.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: foo 1 0", "🔢: c3"]
        }"#,
    );
    let bar = write_fle(
        dir.path(),
        "bar.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: bar 1 0", "🔢: c3"]
        }"#,
    );
    let main = write_fle(
        dir.path(),
        "main.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 6}],
            ".text": ["📤: _start 6 0", "🔢: e8", "❓: .rel(foo - 4)", "🔢: c3"]
        }"#,
    );

    let lib = dir.path().join("libfoo.fa");
    run_tool("ar", &[arg(&lib), arg(&fm), arg(&bar)]);

    let out = dir.path().join("prog");
    run_tool(
        "ld",
        &[
            "-o".to_owned(),
            arg(&out),
            arg(&main),
            "-L".to_owned(),
            arg(dir.path()),
            "-lfoo".to_owned(),
        ],
    );

    let exe = load_fle(&out).unwrap();
    // `fm` was pulled in for `foo`; `bar` stayed out of the link.
    assert!(exe.symbols.iter().any(|s| s.name == "foo"));
    assert!(!exe.symbols.iter().any(|s| s.name == "bar"));
    // Only _start and foo contribute text bytes.
    assert_eq!(exe.sections[".text"].data.len(), 7);
}

#[test]
fn test_shared_library_linkage_through_driver() {
    let dir = tempfile::tempdir().unwrap();
    let puts_impl = write_fle(
        dir.path(),
        "puts.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 6}],
            ".text": ["📤: puts 6 0", "🔢: b8 07 00 00 00 c3"]
        }"#,
    );
    let libc = dir.path().join("libc.fso");
    run_tool(
        "ld",
        &[
            "-shared".to_owned(),
            "-o".to_owned(),
            arg(&libc),
            arg(&puts_impl),
        ],
    );
    let lib = load_fle(&libc).unwrap();
    assert_eq!(lib.kind, ObjectKind::Shared);
    assert!(lib
        .symbols
        .iter()
        .any(|s| s.name == "puts" && s.kind == SymbolKind::Global));

    let main = write_fle(
        dir.path(),
        "main.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 6}],
            ".text": ["📤: _start 6 0", "🔢: e8", "❓: .rel(puts - 4)", "🔢: c3"]
        }"#,
    );
    let out = dir.path().join("prog");
    run_tool(
        "ld",
        &[
            "-o".to_owned(),
            arg(&out),
            arg(&main),
            "-L".to_owned(),
            arg(dir.path()),
            "-lc".to_owned(),
        ],
    );

    let exe = load_fle(&out).unwrap();
    assert_eq!(exe.needed, vec!["libc.fso".to_owned()]);
    // One PLT stub appended to the 6 input bytes.
    let text = &exe.sections[".text"].data;
    assert_eq!(text.len(), 12);
    assert_eq!(&text[6..8], &[0xff, 0x25]);
    // One GOT slot with one ABS64 dynamic relocation naming puts.
    assert_eq!(exe.dyn_relocs.len(), 1);
    let got_phdr = exe.phdrs.iter().find(|p| p.name == ".got").unwrap();
    assert_eq!(exe.dyn_relocs[0].kind, RelocKind::Abs64);
    assert_eq!(exe.dyn_relocs[0].offset, got_phdr.vaddr);
    assert_eq!(exe.dyn_relocs[0].symbol, "puts");
    // The call displacement resolves to the stub at 0x400006.
    let plt_base = 0x400006u64;
    let expected = (plt_base as i64 - 4 - 0x400001) as u32;
    assert_eq!(u32::from_le_bytes(text[1..5].try_into().unwrap()), expected);
    assert_eq!(expected, 1);
}

#[test]
fn test_static_search_prefers_archive() {
    let dir = tempfile::tempdir().unwrap();
    let member = write_fle(
        dir.path(),
        "foo.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: foo 1 0", "🔢: c3"]
        }"#,
    );
    let archive = dir.path().join("libfoo.fa");
    run_tool("ar", &[arg(&archive), arg(&member)]);
    // A shared library with the same name would normally win the search.
    let impl_obj = write_fle(
        dir.path(),
        "impl.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: foo 1 0", "🔢: c3"]
        }"#,
    );
    run_tool(
        "ld",
        &[
            "-shared".to_owned(),
            "-o".to_owned(),
            arg(&dir.path().join("libfoo.fso")),
            arg(&impl_obj),
        ],
    );

    let main = write_fle(
        dir.path(),
        "main.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 6}],
            ".text": ["📤: _start 6 0", "🔢: e8", "❓: .rel(foo - 4)", "🔢: c3"]
        }"#,
    );
    let out = dir.path().join("prog");
    run_tool(
        "ld",
        &[
            "-static".to_owned(),
            "-o".to_owned(),
            arg(&out),
            arg(&main),
            "-L".to_owned(),
            arg(dir.path()),
            "-lfoo".to_owned(),
        ],
    );
    let exe = load_fle(&out).unwrap();
    // Statically satisfied: no shared-library dependency recorded.
    assert!(exe.needed.is_empty());
    assert!(exe.dyn_relocs.is_empty());
}

#[test]
fn test_bss_materialization() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fle(
        dir.path(),
        "bss.fle",
        r#"{
            "type": ".obj",
            "shdrs": [
                {"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 8},
                {"name": ".bss", "type": 8, "flags": 11, "addr": 0, "offset": 8, "size": 4096}
            ],
            ".text": [
                "📤: _start 8 0",
                "🔢: 48 8b 04 25",
                "❓: .abs32s(buffer + 0)"
            ],
            ".bss": ["📤: buffer 4096 0"]
        }"#,
    );
    let out = dir.path().join("prog");
    run_tool("ld", &["-o".to_owned(), arg(&out), arg(&input)]);
    let exe = load_fle(&out).unwrap();
    let bss = exe.phdrs.iter().find(|p| p.name == ".bss").unwrap();
    assert_eq!(bss.size, 4096);
    assert_eq!(bss.vaddr % 4096, 0);
    // The global resolves to bss_base + 0 and is exported section-relative.
    let buffer = exe.symbols.iter().find(|s| s.name == "buffer").unwrap();
    assert_eq!(buffer.section, ".bss");
    assert_eq!(buffer.offset, 0);
    let site = u32::from_le_bytes(exe.sections[".text"].data[4..8].try_into().unwrap());
    assert_eq!(u64::from(site), bss.vaddr);
}

#[test]
fn test_objdump_round_trips_linked_output() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_fle(dir.path(), "a.fle", CALLER);
    let b = write_fle(dir.path(), "b.fle", HELPER);
    let out = dir.path().join("prog");
    run_tool("ld", &["-o".to_owned(), arg(&out), arg(&a), arg(&b)]);

    run_tool("objdump", &[arg(&out)]);
    let dumped = PathBuf::from(format!("{}.objdump", out.display()));
    let original = load_fle(&out).unwrap();
    let mut round_tripped = load_fle(&dumped).unwrap();
    round_tripped.name = original.name.clone();
    assert_eq!(original, round_tripped);
}

#[test]
fn test_multiple_definition_error_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_fle(
        dir.path(),
        "a.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: dup 1 0", "🔢: c3"]
        }"#,
    );
    let b = write_fle(
        dir.path(),
        "b.fle",
        r#"{
            "type": ".obj",
            "shdrs": [{"name": ".text", "type": 1, "flags": 7, "addr": 0, "offset": 0, "size": 1}],
            ".text": ["📤: dup 1 0", "🔢: c3"]
        }"#,
    );
    let out = dir.path().join("prog");
    let err = Driver::from_invocation(
        "ld",
        &["-o".to_owned(), arg(&out), arg(&a), arg(&b)],
    )
    .unwrap()
    .run()
    .unwrap_err();
    assert!(err.to_string().contains("dup"), "{err}");
    // Partial outputs are never written.
    assert!(!out.exists());
}

#[test]
fn test_missing_library_error_message() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_fle(dir.path(), "a.fle", CALLER);
    let out = dir.path().join("prog");
    let err = Driver::from_invocation(
        "ld",
        &[
            "-o".to_owned(),
            arg(&out),
            arg(&a),
            "-L".to_owned(),
            arg(dir.path()),
            "-lnothere".to_owned(),
        ],
    )
    .unwrap()
    .run()
    .unwrap_err();
    assert!(err.to_string().contains("cannot find -lnothere"), "{err}");
}
