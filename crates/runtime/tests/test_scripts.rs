//! End-to-end script tests: parse real Hybris source, run it through
//! the engine, assert on the produced output and VM state.

use hybris_parser::Parser;
use hybris_runtime::frame::StateKind;
use hybris_runtime::{Vm, VmArgs, engine, value};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Output sink shared with the VM so tests can read what scripts print.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer lock")).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_with_args(source: &str, args: VmArgs) -> (Arc<Vm>, String) {
    let program = Parser::new(source)
        .expect("tokenize")
        .parse()
        .expect("parse");
    let buffer = SharedBuffer::default();
    let vm = Vm::with_output(args, Box::new(buffer.clone()));
    engine::run_program(&vm, &program);
    (vm, buffer.contents())
}

fn run(source: &str) -> (Arc<Vm>, String) {
    run_with_args(source, VmArgs::default())
}

fn assert_clean(vm: &Vm) {
    let frame = vm.main_frame();
    assert!(
        !frame.is_state(StateKind::Exception),
        "unhandled exception: {:?}",
        frame.state_value().map(|v| value::svalue(&v))
    );
}

#[test]
fn test_arithmetic_and_printing() {
    let (vm, out) = run("println(2 + 3 * 4);");
    assert_clean(&vm);
    assert_eq!(out, "14\n");
}

#[test]
fn test_array_contains_prints_index() {
    let (vm, out) = run("a = [1,2,3,4]; println(a.contains(3));");
    assert_clean(&vm);
    assert_eq!(out, "2\n");
}

#[test]
fn test_exception_propagation() {
    let (vm, out) = run("try { throw \"boom\"; } catch(e) { println(e); }");
    assert_clean(&vm);
    assert_eq!(out, "boom\n");
}

#[test]
fn test_class_and_method_dispatch_with_inheritance() {
    let (vm, out) = run(
        "class A { public m(){ return 1; } }\n\
         class B extends A { public m(){ return 2; } }\n\
         b = new B(); println(b.m());",
    );
    assert_clean(&vm);
    assert_eq!(out, "2\n");
}

#[test]
fn test_reflection_call() {
    let (vm, out) = run("function f(x){ return x+1; } println(call(\"f\", 41));");
    assert_clean(&vm);
    assert_eq!(out, "42\n");
}

#[test]
fn test_gc_usage_stays_bounded_across_short_lived_allocations() {
    // a tight collection threshold so cycles run during the loop
    let args = VmArgs {
        gc_threshold: Some(64 * 1024),
        ..VmArgs::default()
    };
    let (vm, _) = run_with_args(
        "for( i = 0; i < 10000; i += 1 ){\n\
         \ts = \"some throwaway string payload \" + i;\n\
         }\n\
         println(\"done\");",
        args,
    );
    assert_clean(&vm);
    let usage = vm.gc().usage();
    let collections = vm.gc().collections;
    assert!(collections > 0, "the loop should have triggered cycles");
    // far below what 10,000 live strings would occupy
    assert!(
        usage < 1024 * 1024,
        "usage {} bytes suggests the loop garbage survived",
        usage
    );
}

#[test]
fn test_builtin_arity_validation() {
    let (vm, _) = run("try { strlen(\"a\", \"b\"); } catch(e) { err = e; }");
    assert_clean(&vm);
    let err = value::svalue(&vm.main_frame().get("err").expect("err"));
    assert!(err.contains("SyntaxError"), "{}", err);
}

#[test]
fn test_builtin_type_validation_names_position() {
    let (vm, _) = run("try { strlen(42); } catch(e) { err = e; }");
    assert_clean(&vm);
    let err = value::svalue(&vm.main_frame().get("err").expect("err"));
    assert!(err.contains("TypeError"), "{}", err);
    assert!(err.contains("argument 1"), "{}", err);
}

#[test]
fn test_builtin_fewer_arguments_than_declared_succeed() {
    // substr declares arities [2, 3]; two arguments pick the first
    let (vm, out) = run("println(substr(\"hybris\", 2));");
    assert_clean(&vm);
    assert_eq!(out, "bris\n");
}

#[test]
fn test_serialize_deserialize_round_trip() {
    let (vm, out) = run(
        "v = [1, \"two\", 3.5];\n\
         b = serialize(v);\n\
         w = deserialize(b);\n\
         println(w);\n\
         println(v == w);",
    );
    assert_clean(&vm);
    assert_eq!(out, "[1, two, 3.5]\n1\n");
}

#[test]
fn test_xml_round_trip() {
    let (vm, out) = run(
        "m = [ \"a\" : 1, \"b\" : [2, 3] ];\n\
         x = to_xml(m);\n\
         n = from_xml(x);\n\
         println(m == n);",
    );
    assert_clean(&vm);
    assert_eq!(out, "1\n");
}

#[test]
fn test_string_builtins() {
    let (vm, out) = run(
        "println(strlen(\"hello\"));\n\
         println(toupper(\"abc\"));\n\
         println(strsplit(\"a,b,c\", \",\").join(\"-\"));",
    );
    assert_clean(&vm);
    assert_eq!(out, "5\nABC\na-b-c\n");
}

#[test]
fn test_regex_builtins_and_operator() {
    let (vm, out) = run(
        "println(rex_match(\"hello world\", \"wo.ld\"));\n\
         println(rex_replace(\"a1 b2\", \"[0-9]\", \"X\"));\n\
         println(\"2024-01-15\" ~= \"([0-9]+)-([0-9]+)-([0-9]+)\");",
    );
    assert_clean(&vm);
    assert_eq!(out, "1\naX bX\n[2024, 01, 15]\n");
}

#[test]
fn test_math_builtins() {
    let (vm, out) = run("println(pow(2, 10)); println(abs(-5)); println(floor(3.9));");
    assert_clean(&vm);
    assert_eq!(out, "1024\n5\n3\n");
}

#[test]
fn test_typeof_and_predicates() {
    let (vm, out) = run(
        "println(typeof(1));\n\
         println(typeof(\"s\"));\n\
         println(typeof([1]));\n\
         println(isint(1), isstring(1));",
    );
    assert_clean(&vm);
    assert_eq!(out, "integer\nstring\nvector\n10\n");
}

#[test]
fn test_worker_thread_runs_and_joins() {
    let (vm, out) = run(
        "function worker(a, b){ return a + b; }\n\
         t = pthread_create(\"worker\", 1, 2);\n\
         pthread_join(t);\n\
         println(\"joined\");",
    );
    assert_clean(&vm);
    assert_eq!(out, "joined\n");
    // the worker's scope is gone once it finished
    assert_eq!(vm.scopes().thread_ids().len(), 0);
}

#[test]
fn test_file_builtins_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("notes.txt");
    let script = format!(
        "h = fopen(\"{path}\", \"w\");\n\
         fwrite(h, \"line one\\n\");\n\
         fwrite(h, \"line two\\n\");\n\
         fclose(h);\n\
         h = fopen(\"{path}\", \"r\");\n\
         println(fgets(h));\n\
         println(fgets(h));\n\
         fclose(h);\n\
         println(fsize(\"{path}\"));",
        path = path.display()
    );
    let (vm, out) = run(&script);
    assert_clean(&vm);
    assert_eq!(out, "line one\nline two\n18\n");
}

#[test]
fn test_encoding_builtins() {
    let (vm, out) = run(
        "println(base64encode(\"hybris\"));\n\
         println(tostring(base64decode(\"aHlicmlz\")));\n\
         println(hexencode(\"AB\"));",
    );
    assert_clean(&vm);
    assert_eq!(out, "aHlicmlz\n68 79 62 72 69 73\n4142\n");
}

#[test]
fn test_gc_builtins_report_state() {
    let (vm, out) = run(
        "u = gc_mm_usage();\n\
         println(u > 0);\n\
         println(gc_collect_threshold() > 0);\n\
         old = gc_set_collect_threshold(12345);\n\
         println(gc_collect_threshold());",
    );
    assert_clean(&vm);
    assert_eq!(out, "1\n1\n12345\n");
}

#[test]
#[serial_test::serial]
fn test_lib_path_env_var_feeds_constants() {
    // env mutation is process-wide, so this test runs serialized
    unsafe { std::env::set_var("HYBRIS_LIB_PATH", "/tmp/hyblib/") };
    let (vm, out) = run("println(__LIB_PATH__);");
    unsafe { std::env::remove_var("HYBRIS_LIB_PATH") };
    assert_clean(&vm);
    assert_eq!(out, "/tmp/hyblib/\n");
}

#[test]
fn test_unhandled_exception_is_left_on_main_frame() {
    let (vm, _) = run("function f(){ throw \"lost\"; } f();");
    let frame = vm.main_frame();
    assert!(frame.is_state(StateKind::Exception));
    assert_eq!(
        value::svalue(&frame.state_value().expect("exception value")),
        "lost"
    );
}

#[test]
fn test_script_constants_are_injected() {
    let args = VmArgs {
        script_args: vec!["alpha".to_string(), "beta".to_string()],
        ..VmArgs::default()
    };
    let (vm, out) = run_with_args("println(argc); println($0, \" \", $1);", args);
    assert_clean(&vm);
    // $0 and $1 resolve the numbered argv constants dynamically
    assert_eq!(out, "2\nalpha beta\n");
}

#[test]
fn test_inplace_mutation_cannot_corrupt_shared_literals() {
    // the literal 0 inside f is one shared constant; the in-place add
    // must touch a private copy, so a second call starts from 0 again
    let (vm, out) = run(
        "function f(){ x = 0; x += 1; return x; }\n\
         f();\n\
         println(f());",
    );
    assert_clean(&vm);
    assert_eq!(out, "1\n");
}

#[test]
fn test_frames_balance_across_statements() {
    let (vm, _) = run(
        "function f(x){ return x * 2; }\n\
         a = f(2);\n\
         b = [f(1), f(2), f(3)];\n\
         foreach( x of b ){ a += x; }",
    );
    assert_clean(&vm);
    assert_eq!(vm.scopes().depth(), 1);
}
