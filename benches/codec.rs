use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};
use lopdf::{Document, Object, Stream, dictionary};
use mxfile_core::model::{Encoding, FileData};
use mxfile_core::{pdf, png, sniff};
use std::hint::black_box;

fn diagram_xml(cells: usize) -> String {
    let mut out = String::from("<mxfile><diagram id=\"bench\"><mxGraphModel><root>");
    out.push_str("<mxCell id=\"0\"/><mxCell id=\"1\" parent=\"0\"/>");
    for i in 0..cells {
        out.push_str(&format!(
            "<mxCell id=\"n{i}\" value=\"Node {i}\" vertex=\"1\" parent=\"1\">\
             <mxGeometry x=\"{}\" y=\"{}\" width=\"120\" height=\"60\" as=\"geometry\"/></mxCell>",
            (i % 10) * 160,
            (i / 10) * 100
        ));
    }
    out.push_str("</root></mxGraphModel></diagram></mxfile>");
    out
}

fn sample_png(side: u32) -> Vec<u8> {
    let pixels = vec![180u8; (side * side * 4) as usize];
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&pixels, side, side, ExtendedColorType::Rgba8)
        .expect("png encode");
    out
}

fn page_pdf(width: i64) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(dictionary! {}, b"0 0 10 10 re f".to_vec()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), 600.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).expect("pdf save");
    out
}

fn bench_sniff(c: &mut Criterion) {
    let mut group = c.benchmark_group("sniff");
    let xml = diagram_xml(200);
    let cases = [
        ("mxfile_utf8", FileData::from(xml.as_str()), Some(Encoding::Utf8)),
        (
            "png_base64",
            FileData::from(base64_of(&sample_png(64))),
            Some(Encoding::Base64),
        ),
        ("png_binary", FileData::Binary(sample_png(64)), None),
        ("rejected", FileData::from("null"), None),
    ];
    for (name, data, encoding) in &cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), data, |b, data| {
            b.iter(|| black_box(sniff::check_file_content(black_box(data), *encoding)));
        });
    }
    group.finish();
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn bench_png_inject(c: &mut Criterion) {
    let mut group = c.benchmark_group("png_inject");
    let image = sample_png(256);
    for cells in [10usize, 200, 2000] {
        let xml = diagram_xml(cells);
        group.bench_with_input(BenchmarkId::new("ztxt", cells), &xml, |b, xml| {
            b.iter(|| {
                let out = png::inject_chunk(black_box(&image), png::DIAGRAM_KEY, xml, true, false)
                    .expect("inject");
                black_box(out);
            });
        });
    }
    group.bench_function("phys", |b| {
        b.iter(|| {
            let out = png::inject_chunk(black_box(&image), png::DPI_KEY, "300", false, false)
                .expect("inject");
            black_box(out);
        });
    });
    group.finish();
}

fn bench_pdf_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pdf_merge");
    let xml = diagram_xml(200);
    for pages in [1usize, 4, 16] {
        let buffers: Vec<Vec<u8>> = (0..pages).map(|i| page_pdf(400 + i as i64)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(pages), &buffers, |b, buffers| {
            b.iter(|| {
                let merged = pdf::merge_pdfs(black_box(buffers), Some(&xml), pdf::DEFAULT_CREATOR)
                    .expect("merge");
                black_box(merged);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sniff, bench_png_inject, bench_pdf_merge);
criterion_main!(benches);
