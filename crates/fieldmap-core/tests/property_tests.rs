//! Property-based tests for fieldmap-core
//!
//! Exercises the invariants the pipeline leans on: lossless coordinate
//! round-trips, store persistence, comparison scoring, and overlay fill
//! accounting. Scenario tests at the bottom walk the full engine path on
//! documents built in-memory with lopdf.

use std::collections::BTreeMap;
use std::fs;

use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use proptest::prelude::*;
use tempfile::tempdir;

use fieldmap_core::analyze::detect_overlaps;
use fieldmap_core::fill::FillStats;
use fieldmap_core::{
    compare, coords, extract, fill, CompareOptions, EngineConfig, FieldPosition, FieldValue,
    FillRequest, PositionEngine, PositionSet, PositionStore, StubRasterizer,
};

// ============================================================
// Strategies
// ============================================================

/// Field names as templates use them: snake_case identifiers.
fn field_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{2,14}"
}

/// Form-sized field boxes: wide enough for a short value, taller and wider
/// than the default 2mm overlap buffer.
fn field_position() -> impl Strategy<Value = FieldPosition> {
    (
        1u32..=3,
        0.0f64..190.0,
        0.0f64..260.0,
        5.0f64..60.0,
        3.0f64..20.0,
    )
        .prop_map(|(page, x, y, width, height)| FieldPosition::new(page, x, y, width, height))
}

/// A non-empty position set under a fixed template id.
fn position_set() -> impl Strategy<Value = PositionSet> {
    proptest::collection::btree_map(field_name(), field_position(), 1..8).prop_map(|fields| {
        let mut set = PositionSet::new("prop");
        for (name, position) in fields {
            set.insert(name, position);
        }
        set
    })
}

// ============================================================
// Document Builders
// ============================================================

/// A minimal parseable document with `num_pages` empty Letter pages.
fn blank_pdf(num_pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for _ in 0..num_pages {
        let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => Object::Reference(content_id),
        });
        kids.push(Object::Reference(page_id));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => num_pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save blank pdf");
    bytes
}

/// A one-page Letter document carrying one text widget per `(name, rect)`.
fn form_pdf(widgets: &[(&str, [f64; 4])]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));

    let mut annots = Vec::new();
    for (name, rect) in widgets {
        let id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Tx",
            "T" => Object::string_literal(*name),
            "Rect" => vec![
                Object::Real(rect[0] as f32),
                Object::Real(rect[1] as f32),
                Object::Real(rect[2] as f32),
                Object::Real(rect[3] as f32),
            ],
        });
        annots.push(Object::Reference(id));
    }

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => Object::Reference(content_id),
        "Annots" => Object::Array(annots.clone()),
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let acroform_id = doc.add_object(dictionary! {
        "Fields" => Object::Array(annots),
    });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
        "AcroForm" => Object::Reference(acroform_id),
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save form pdf");
    bytes
}

/// Concatenated content-stream text of every page in a rendered document.
fn page_text_ops(bytes: &[u8]) -> String {
    let doc = Document::load_mem(bytes).expect("rendered output parses");
    let mut out = String::new();
    for (_, page_id) in doc.get_pages() {
        let page = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .expect("page dictionary");
        let Ok(contents) = page.get(b"Contents") else {
            continue;
        };
        let stream_ids: Vec<ObjectId> = match contents {
            Object::Reference(id) => vec![*id],
            Object::Array(items) => items.iter().filter_map(|o| o.as_reference().ok()).collect(),
            _ => Vec::new(),
        };
        for id in stream_ids {
            if let Ok(Object::Stream(stream)) = doc.get_object(id) {
                let data = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                out.push_str(&String::from_utf8_lossy(&data));
                out.push('\n');
            }
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ============================================================
    // Coordinate Round-Trip Tests
    // ============================================================

    #[test]
    fn coordinate_round_trip_stays_within_a_hundredth_mm(
        pdf_x in 0.0f64..612.0,
        pdf_y in 0.0f64..792.0,
        page_height_pt in 100.0f64..1200.0,
    ) {
        let (x_mm, y_mm) = coords::to_storage(pdf_x, pdf_y, page_height_pt);
        let (back_x, back_y) = coords::to_source(x_mm, y_mm, page_height_pt);
        prop_assert!(coords::pt_to_mm((back_x - pdf_x).abs()) < 0.01);
        prop_assert!(coords::pt_to_mm((back_y - pdf_y).abs()) < 0.01);
    }

    #[test]
    fn top_of_page_maps_to_zero_storage_y(page_height_pt in 100.0f64..1200.0) {
        let (_, y_mm) = coords::to_storage(0.0, page_height_pt, page_height_pt);
        prop_assert!(y_mm.abs() < 1e-9);
    }

    #[test]
    fn storage_y_grows_downward(
        pdf_y in 0.0f64..700.0,
        drop in 1.0f64..90.0,
    ) {
        // Lower on the page (smaller pdf y) means larger storage y.
        let (_, upper) = coords::to_storage(0.0, pdf_y + drop, 792.0);
        let (_, lower) = coords::to_storage(0.0, pdf_y, 792.0);
        prop_assert!(lower > upper);
    }

    // ============================================================
    // Store Round-Trip Tests
    // ============================================================

    #[test]
    fn store_round_trip_preserves_every_field(set in position_set()) {
        let dir = tempdir().expect("tempdir");
        let store = PositionStore::new(dir.path());
        store.save(&set).expect("save");
        let loaded = store.load(&set.template_id).expect("load");
        prop_assert_eq!(&loaded.template_id, &set.template_id);
        prop_assert_eq!(loaded.fields, set.fields);
    }

    #[test]
    fn saving_twice_keeps_only_the_last_write(
        first in position_set(),
        second in position_set(),
    ) {
        let dir = tempdir().expect("tempdir");
        let store = PositionStore::new(dir.path());
        store.save(&first).expect("first save");
        store.save(&second).expect("second save");
        let loaded = store.load("prop").expect("load");
        prop_assert_eq!(loaded.fields, second.fields);
    }

    // ============================================================
    // Comparison Scoring Tests
    // ============================================================

    #[test]
    fn comparing_a_set_with_itself_is_perfect(set in position_set()) {
        let report = compare(&set, &set, &CompareOptions::default());
        prop_assert_eq!(report.matched, set.len());
        prop_assert_eq!(report.misaligned, 0);
        prop_assert_eq!(report.missing, 0);
        prop_assert_eq!(report.extra, 0);
        prop_assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
        prop_assert!(report.suggested_correction.is_none());
    }

    #[test]
    fn disjoint_field_names_score_zero(set in position_set()) {
        let mut expected = PositionSet::new(set.template_id.clone());
        for (name, position) in set.iter() {
            // '-' never appears in generated names, so these cannot collide.
            expected.insert(format!("{}-ref", name), position.clone());
        }
        let report = compare(&set, &expected, &CompareOptions::default());
        prop_assert_eq!(report.matched, 0);
        prop_assert_eq!(report.missing, expected.len());
        prop_assert_eq!(report.extra, set.len());
        prop_assert!(report.accuracy.abs() < f64::EPSILON);
    }

    #[test]
    fn uniform_drift_is_reported_as_the_mean_delta(
        set in position_set(),
        dx in 1.5f64..15.0,
        dy in -15.0f64..-1.5,
    ) {
        let mut actual = PositionSet::new(set.template_id.clone());
        for (name, position) in set.iter() {
            let mut moved = position.clone();
            moved.x += dx;
            moved.y += dy;
            actual.insert(name.clone(), moved);
        }
        let report = compare(&actual, &set, &CompareOptions::default());
        prop_assert_eq!(report.matched, 0);
        prop_assert_eq!(report.misaligned, set.len());
        let (sx, sy) = report.suggested_correction.expect("suggestion present");
        prop_assert!((sx - dx).abs() < 1e-6);
        prop_assert!((sy - dy).abs() < 1e-6);
    }

    #[test]
    fn extra_fields_never_lower_accuracy(set in position_set()) {
        let mut actual = set.clone();
        actual.insert("unexpected-extra", FieldPosition::new(1, 10.0, 10.0, 20.0, 5.0));
        let report = compare(&actual, &set, &CompareOptions::default());
        prop_assert_eq!(report.extra, 1);
        prop_assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
    }

    // ============================================================
    // Overlap Detection Tests
    // ============================================================

    #[test]
    fn identical_rectangles_collide_only_on_the_same_page(
        position in field_position(),
        same_page in any::<bool>(),
    ) {
        let mut twin = position.clone();
        if !same_page {
            twin.page = position.page + 1;
        }
        let mut set = PositionSet::new("overlap");
        set.insert("first", position);
        set.insert("second", twin);
        let overlaps = detect_overlaps(&set, 2.0);
        if same_page {
            prop_assert_eq!(overlaps.len(), 1);
        } else {
            prop_assert!(overlaps.is_empty());
        }
    }

    // ============================================================
    // Fill Accounting Tests
    // ============================================================

    #[test]
    fn filling_draws_exactly_the_valued_subset(
        set in position_set(),
        selector in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let names: Vec<String> = set.iter().map(|(name, _)| name.clone()).collect();
        let mut values = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            if selector[i % selector.len()] {
                values.insert(name.clone(), FieldValue::Text(format!("v{}", i)));
            }
        }

        let (bytes, stats) = fill::overlay_on_source(&blank_pdf(3), &set, &values)
            .expect("overlay succeeds");
        prop_assert_eq!(stats.filled, values.len());
        prop_assert_eq!(stats.filled + stats.skipped, set.len());

        let content = page_text_ops(&bytes);
        for (i, name) in names.iter().enumerate() {
            let drawn = content.contains(&format!("(v{}) Tj", i));
            prop_assert_eq!(drawn, values.contains_key(name));
        }
    }
}

// ============================================================
// Scenario Tests (non-property)
// ============================================================

mod scenarios {
    use super::*;

    #[test]
    fn case_number_lands_at_its_templated_spot() {
        let mut positions = PositionSet::new("fl100");
        positions.insert("case_number", FieldPosition::new(1, 140.0, 20.0, 50.0, 8.0));
        let mut values = BTreeMap::new();
        values.insert(
            "case_number".to_string(),
            FieldValue::Text("FL-2024-0001".to_string()),
        );

        let (bytes, stats) =
            fill::overlay_on_source(&blank_pdf(1), &positions, &values).expect("overlay");
        assert_eq!(
            stats,
            FillStats {
                filled: 1,
                skipped: 0
            }
        );

        let content = page_text_ops(&bytes);
        assert!(
            content.contains("(FL-2024-0001) Tj"),
            "value not drawn literally: {content}"
        );
        // 140mm from the left edge is 396.85pt.
        assert!(
            content.contains("396.85"),
            "x origin not at 140mm: {content}"
        );
    }

    #[test]
    fn scanned_documents_fall_back_to_page_backgrounds() {
        let dir = tempdir().expect("tempdir");
        let source_path = dir.path().join("scan.pdf");
        fs::write(&source_path, blank_pdf(2)).expect("write source");
        let backgrounds_dir = dir.path().join("backgrounds");
        let rasterizer = StubRasterizer::new(120, 160);

        let result = extract::extract_positions(&source_path, "scan", &backgrounds_dir, &rasterizer)
            .expect("fallback extraction");

        assert!(result.used_fallback());
        assert!(result.fields.is_empty());
        assert_eq!(result.page_count, 2);
        assert_eq!(
            result.background_images.keys().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
        for page in 1..=2u32 {
            let path = backgrounds_dir.join(extract::background_image_name("scan", page));
            assert!(path.is_file(), "missing background for page {page}");
        }
    }

    #[test]
    fn extract_fill_compare_round_trip_scores_perfectly() {
        let dir = tempdir().expect("tempdir");
        let config = EngineConfig {
            templates_dir: dir.path().join("templates"),
            positions_dir: dir.path().join("positions"),
            backgrounds_dir: dir.path().join("backgrounds"),
            raster_dpi: 150,
        };
        fs::create_dir_all(&config.templates_dir).expect("templates dir");
        let source_path = config.templates_dir.join("fl100.pdf");
        fs::write(
            &source_path,
            form_pdf(&[
                ("case_number", [400.0, 735.0, 540.0, 757.0]),
                ("petitioner_name", [100.0, 680.0, 300.0, 700.0]),
            ]),
        )
        .expect("write template");

        let engine =
            PositionEngine::with_rasterizer(config, Box::new(StubRasterizer::new(80, 100)));

        let extracted = engine.extract(&source_path, "fl100").expect("extract");
        assert!(extracted.has_fields());
        assert_eq!(extracted.fields.len(), 2);
        assert!(engine.store().contains("fl100"));

        // A copy of what extraction just persisted is a perfect reference.
        let reference = dir.path().join("reference.json");
        fs::copy(engine.store().path_for("fl100"), &reference).expect("copy reference");

        let mut values = BTreeMap::new();
        values.insert(
            "case_number".to_string(),
            FieldValue::Text("FL-2024-0001".to_string()),
        );
        let request = FillRequest {
            template_id: "fl100".to_string(),
            values,
            output_path: dir.path().join("out").join("filled.pdf"),
        };
        let outcome = engine.fill(&request).expect("fill");
        assert_eq!(outcome.fields_filled, 1);
        assert_eq!(outcome.fields_skipped, 1);
        assert_eq!(outcome.page_count, 1);
        assert!(request.output_path.is_file());
        assert!(page_text_ops(&fs::read(&request.output_path).expect("read output"))
            .contains("(FL-2024-0001) Tj"));

        let report = engine.compare("fl100", &reference).expect("compare");
        assert_eq!(report.matched, 2);
        assert_eq!(report.misaligned + report.missing + report.extra, 0);
        assert!((report.accuracy - 1.0).abs() < f64::EPSILON);
        assert!(report.overlaps.is_empty());
        assert!(report.spacing_violations.is_empty());
    }

    #[test]
    fn template_with_no_artifacts_cannot_be_filled() {
        // Never extracted: no position file (an empty set is fine), but also
        // no source document and no backgrounds to render onto.
        let dir = tempdir().expect("tempdir");
        let config = EngineConfig {
            templates_dir: dir.path().join("templates"),
            positions_dir: dir.path().join("positions"),
            backgrounds_dir: dir.path().join("backgrounds"),
            raster_dpi: 150,
        };
        let engine =
            PositionEngine::with_rasterizer(config, Box::new(StubRasterizer::new(80, 100)));

        let request = FillRequest {
            template_id: "never-extracted".to_string(),
            values: BTreeMap::new(),
            output_path: dir.path().join("out.pdf"),
        };
        let err = engine.fill(&request).expect_err("nothing to render onto");
        assert!(matches!(
            err,
            fieldmap_core::RenderError::MissingBackground(1)
        ));
        assert!(!request.output_path.exists());
    }
}
