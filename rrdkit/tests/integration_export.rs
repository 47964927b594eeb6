//! Integration tests for DEF/CDEF/VDEF resolution, export and graph requests.

use std::path::{Path, PathBuf};

use rrdkit::error::{ExprError, QueryError, RenderError, RrdError};
use rrdkit::graph::Window;
use rrdkit::{
    ArchiveDef, ArchiveSpec, ConsolidationFn, DataSourceDef, Definitions, Directive, Exporter,
    Grapher, InfoValue, RenderBackend, RenderOutput, Rrd, Scene,
};
use tempfile::{TempDir, tempdir};

/// Helper: archive `a` with a 10s step holding `(t / 10) % 3`, archive `b`
/// with a 15s step alternating 4 and 2. Both end at 1200.
fn two_archives(dir: &TempDir) -> (PathBuf, PathBuf) {
    let a_path = dir.path().join("a.rrd");
    let b_path = dir.path().join("b.rrd");

    let mut a = Rrd::create(
        &a_path,
        &ArchiveSpec {
            start: 900,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("x", 20, None, None)],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 100)],
        },
        false,
    )
    .unwrap();
    for t in (910..=1200).step_by(10) {
        a.update(t, &[((t / 10) % 3) as f64]).unwrap();
    }

    let mut b = Rrd::create(
        &b_path,
        &ArchiveSpec {
            start: 900,
            step: 15,
            data_sources: vec![
                DataSourceDef::gauge("other", 30, None, None),
                DataSourceDef::gauge("y", 30, None, None),
            ],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 100)],
        },
        false,
    )
    .unwrap();
    for t in (915..=1200).step_by(15) {
        let y = if (t / 15) % 2 == 0 { 2.0 } else { 4.0 };
        b.update(t, &[0.0, y]).unwrap();
    }

    (a_path, b_path)
}

#[test]
fn test_export_lcm_reconsolidation() {
    let temp_dir = tempdir().unwrap();
    let (a_path, b_path) = two_archives(&temp_dir);

    let result = Exporter::new(1050, 1200)
        .def("a", &a_path, "x", ConsolidationFn::Average)
        .def("b", &b_path, "y", ConsolidationFn::Average)
        // Forward reference: `sum` is used before it is defined.
        .vdef("peak", "sum,MAXIMUM")
        .cdef("sum", "a,b,+")
        .column("a", "a average")
        .column("b", "b average")
        .column("sum", "a plus b")
        .xport()
        .unwrap();

    // 10s and 15s archives meet on a 30s grid.
    assert_eq!((result.start, result.end, result.step), (1050, 1200, 30));
    assert_eq!(result.rows(), 5);
    assert_eq!(result.legends, vec!["a average", "b average", "a plus b"]);
    for (timestamp, row) in result.iter() {
        assert_eq!(row, &[1.0, 3.0, 4.0], "row ending {timestamp}");
    }
    assert_eq!(result.timestamp(0), 1080);

    let peak = result.scalars["peak"];
    assert_eq!(peak.value, 4.0);
    assert_eq!(peak.timestamp, Some(1080));
}

#[test]
fn test_export_coarser_requested_step() {
    let temp_dir = tempdir().unwrap();
    let (a_path, _) = two_archives(&temp_dir);

    let result = Exporter::new(1020, 1200)
        .step(60)
        .def("a", &a_path, "x", ConsolidationFn::Max)
        .column("a", "a")
        .xport();
    // No MAX archive exists.
    assert!(matches!(
        result,
        Err(RrdError::Query(QueryError::NoMatchingArchive { .. }))
    ));

    let result = Exporter::new(1020, 1200)
        .step(60)
        .def("a", &a_path, "x", ConsolidationFn::Average)
        .column("a", "a")
        .xport()
        .unwrap();
    assert_eq!(result.step, 60);
    assert_eq!(result.rows(), 3);
    assert!(result.data.iter().all(|v| *v == 1.0));
}

#[test]
fn test_export_validates_before_io() {
    let missing = Path::new("/nonexistent/never.rrd");

    let err = Exporter::new(0, 100)
        .def("a", missing, "x", ConsolidationFn::Average)
        .cdef("b", "a,c,+")
        .column("b", "b")
        .xport()
        .unwrap_err();
    assert!(matches!(err, RrdError::Expr(ExprError::InvalidExpression { .. })));

    let err = Exporter::new(0, 100)
        .def("a", missing, "x", ConsolidationFn::Average)
        .cdef("b", "c,1,+")
        .cdef("c", "b,1,+")
        .column("b", "b")
        .xport()
        .unwrap_err();
    assert!(matches!(err, RrdError::Expr(ExprError::CyclicExpression { .. })));

    // Valid definitions reach the file system.
    let err = Exporter::new(0, 100)
        .def("a", missing, "x", ConsolidationFn::Average)
        .column("a", "a")
        .xport()
        .unwrap_err();
    assert!(matches!(err, RrdError::FileIo(_)));
}

#[test]
fn test_export_unknown_data_source() {
    let temp_dir = tempdir().unwrap();
    let (a_path, _) = two_archives(&temp_dir);

    let err = Exporter::new(1050, 1200)
        .def("a", &a_path, "nope", ConsolidationFn::Average)
        .column("a", "a")
        .xport()
        .unwrap_err();
    assert!(matches!(
        err,
        RrdError::Query(QueryError::UnknownDataSource { ref name, .. }) if name == "nope"
    ));
}

/// Backend that records what it was given.
#[derive(Default)]
struct Recorder {
    window: Option<Window>,
    value_range: Option<(f64, f64)>,
    title: Option<String>,
    doubled: Vec<f64>,
    top: Option<f64>,
    directives: usize,
}

impl RenderBackend for Recorder {
    fn render(&mut self, scene: &Scene<'_>) -> Result<RenderOutput, RenderError> {
        self.window = Some(scene.window);
        self.value_range = scene.value_range;
        self.title = scene.title.map(str::to_string);
        self.doubled = scene.series["double"].clone();
        self.top = scene.scalars.get("top").map(|s| s.value);
        self.directives = scene.directives.len();

        let mut info = std::collections::BTreeMap::new();
        info.insert("image_width".to_string(), InfoValue::Count(u64::from(scene.canvas.width)));
        Ok(RenderOutput {
            info,
            image: b"\x89PNG fake".to_vec(),
        })
    }
}

struct Failing;

impl RenderBackend for Failing {
    fn render(&mut self, _scene: &Scene<'_>) -> Result<RenderOutput, RenderError> {
        Err(RenderError::BackendFailed {
            reason: "out of ink".to_string(),
        })
    }
}

fn gauge_archive(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("g.rrd");
    let mut rrd = Rrd::create(
        &path,
        &ArchiveSpec {
            start: 1000,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("v", 20, None, None)],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 20)],
        },
        false,
    )
    .unwrap();
    for i in 1..=6u64 {
        rrd.update(1000 + i * 10, &[i as f64]).unwrap();
    }
    path
}

#[test]
fn test_graph_with_backend() {
    let temp_dir = tempdir().unwrap();
    let path = gauge_archive(&temp_dir);
    let image_path = temp_dir.path().join("graph.png");

    let grapher = Grapher::new(1000, 1060)
        .title("Doubled")
        .size(640, 200)
        .def("v", &path, "v", ConsolidationFn::Average)
        .cdef("double", "v,2,*")
        .vdef("top", "double,MAXIMUM")
        .line(2.0, "double", "#ff0000", Some("doubled"))
        .area("v", "#00ff00", None)
        .gprint("top", "%6.2lf")
        .directive(Directive::PrintTime {
            name: "top".to_string(),
            format: "%H:%M".to_string(),
        });

    let mut backend = Recorder::default();
    let output = grapher.save_graph(&mut backend, &image_path).unwrap();

    assert_eq!(output.info["image_width"], InfoValue::Count(640));
    assert_eq!(std::fs::read(&image_path).unwrap(), output.image);
    assert_eq!(
        backend.window,
        Some(Window {
            start: 1000,
            end: 1060,
            step: 10
        })
    );
    assert_eq!(backend.title.as_deref(), Some("Doubled"));
    assert_eq!(backend.doubled, vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);
    assert_eq!(backend.top, Some(12.0));
    assert_eq!(backend.value_range, Some((1.0, 12.0)));
    assert_eq!(backend.directives, 4);
}

#[test]
fn test_graph_errors() {
    let temp_dir = tempdir().unwrap();
    let path = gauge_archive(&temp_dir);

    let mut definitions = Definitions::new();
    definitions.def("v", &path, "v", ConsolidationFn::Average);

    let err = Grapher::new(1000, 1060)
        .definitions(definitions.clone())
        .line(1.0, "v", "#000000", None)
        .graph(&mut Failing)
        .unwrap_err();
    assert!(matches!(err, RrdError::Render(RenderError::BackendFailed { .. })));

    let err = Grapher::new(1000, 1060)
        .definitions(definitions)
        .print("v", "%lf")
        .graph(&mut Recorder::default())
        .unwrap_err();
    assert!(matches!(err, RrdError::Render(RenderError::UndefinedName { ref name }) if name == "v"));

    // An unwritable image path.
    let err = Grapher::new(1000, 1060)
        .def("v", &path, "v", ConsolidationFn::Average)
        .cdef("double", "v,2,*")
        .save_graph(&mut Recorder::default(), temp_dir.path().join("missing").join("x.png"))
        .unwrap_err();
    assert!(matches!(err, RrdError::Render(RenderError::WriteImage { .. })));
}
