use std::fs;

use probe_core::services::detection::{BuildStage, ParseOutput, ParseSelector, Parser};
use probe_core::services::parsers::{BuildLogParser, CompilerLines};
use probe_core::services::ProbeError;
use tempfile::tempdir;

const LOG: &str = "\
dh_auto_build
g++ -DVERSION=\"1.2\" -O2 -c main.cpp -o main.o
g++ -O2 -c util.cpp -o util.o
g++ -fPIE -pie -o Widget main.o util.o
g++ --version
make[1]: Leaving directory
";

fn lines(output: ParseOutput) -> Vec<String> {
    match output {
        ParseOutput::Lines(lines) => lines,
        other => panic!("expected lines, got {other:?}"),
    }
}

#[test]
fn classify_buckets_compiler_lines_by_role() {
    let classified = CompilerLines::classify(LOG, Some("widget"));
    assert_eq!(classified.all.len(), 4);
    assert_eq!(classified.linker, vec!["g++ -fPIE -pie -o Widget main.o util.o"]);
    assert_eq!(classified.objects.len(), 2);
    assert_eq!(classified.others, vec!["g++ --version"]);
}

#[test]
fn classify_strips_define_flags() {
    let classified = CompilerLines::classify(LOG, Some("widget"));
    assert_eq!(classified.objects[0], "g++  -O2 -c main.cpp -o main.o");
    assert!(classified.all.iter().all(|line| !line.contains("-DVERSION")));
}

#[test]
fn classify_without_binary_name_takes_any_output_line() {
    let classified = CompilerLines::classify("g++ -fPIE -o foo foo.o\n", None);
    assert_eq!(classified.linker, vec!["g++ -fPIE -o foo foo.o"]);
    assert!(classified.objects.is_empty());
}

#[test]
fn stage_selects_matching_bucket() {
    let classified = CompilerLines::classify(LOG, Some("Widget"));
    assert_eq!(classified.stage(BuildStage::Linker).len(), 1);
    assert_eq!(classified.stage(BuildStage::Objects).len(), 2);
    assert_eq!(classified.stage(BuildStage::Others).len(), 1);
    assert_eq!(classified.stage(BuildStage::All).len(), 4);
}

#[test]
fn parser_reads_log_once_and_serves_cached_lines() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("build.log");
    fs::write(&log, LOG).unwrap();
    let parser = BuildLogParser::new("build_log", log.clone(), Some("widget".into()));

    let first = lines(parser.parse(&ParseSelector::Stage(BuildStage::Linker)).unwrap());
    fs::remove_file(&log).unwrap();
    let second = lines(parser.parse(&ParseSelector::Stage(BuildStage::Linker)).unwrap());
    assert_eq!(first, second);
    assert_eq!(lines(parser.parse(&ParseSelector::Stage(BuildStage::All)).unwrap()).len(), 4);
}

#[test]
fn parser_rejects_variable_selector() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("build.log");
    fs::write(&log, LOG).unwrap();
    let parser = BuildLogParser::new("build_log", log, None);
    let err = parser.parse(&ParseSelector::Variable("CXXFLAGS".into())).unwrap_err();
    assert!(matches!(err, ProbeError::UnsupportedSelector { .. }));
}

#[test]
fn missing_log_is_an_io_error_on_first_parse() {
    let temp = tempdir().unwrap();
    let parser = BuildLogParser::new("build_log", temp.path().join("absent.log"), None);
    let err = parser.parse(&ParseSelector::Stage(BuildStage::All)).unwrap_err();
    assert!(matches!(err, ProbeError::Io { .. }));
}
