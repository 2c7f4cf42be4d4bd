use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use weft::advanced::parse;
use weft::{
    CompileOptions, RenderConfig, RenderOptions, TemplateEngine, Value, compile,
    evaluate_expression, render,
};

const PAGE: &str = r#"<template:Row name score tags>
  <tr class="${score > 50 ? 'hi' : 'lo'}">
    <td>${upper(name)}</td>
    <td>${round(score, 1)}</td>
    <td>${join(tags, ', ')}</td>
  </tr>
</template:Row>
<table>
  @for (row, i of rows) {
    @if (i % 2 == 0) {
      <Row name=${row.name} score=${row.score} tags=${row.tags} />
    } @else {
      <tr><td colspan="3">${row.name ?? 'anonymous'}</td></tr>
    }
  }
</table>"#;

fn large_rows() -> Value {
    let rows: Vec<_> = (0..1_000)
        .map(|n| json!({"name": format!("user{n}"), "score": n % 100, "tags": ["a", "b"]}))
        .collect();
    Value::from(json!({"rows": rows}))
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_page", |b| {
        b.iter(|| compile(black_box(PAGE), &CompileOptions::default()))
    });
}

fn bench_render(c: &mut Criterion) {
    let template = compile(PAGE, &CompileOptions::default());
    let data = large_rows();
    let options = RenderOptions::default();

    c.bench_function("render_1000_rows", |b| {
        b.iter(|| render(black_box(&template), data.clone(), &options).unwrap())
    });

    let tracked =
        RenderOptions::new().with_config(RenderConfig::new().with_source_tracking("rd-"));
    c.bench_function("render_1000_rows_tracked", |b| {
        b.iter(|| render(black_box(&template), data.clone(), &tracked).unwrap())
    });
}

fn bench_expressions(c: &mut Criterion) {
    let src = "a.b[*].c ?? (x + y * 2 > 10 ? upper(name) : 'none')";
    c.bench_function("parse_expression", |b| b.iter(|| parse(black_box(src)).unwrap()));

    let data = json!({"a": {"b": [{"c": 1}, {"c": 2}]}, "x": 3, "y": 4, "name": "n"});
    c.bench_function("evaluate_expression", |b| {
        b.iter(|| evaluate_expression(black_box(src), data.clone()).unwrap())
    });
}

fn bench_engine(c: &mut Criterion) {
    let mut engine = TemplateEngine::new();
    engine.add_template("page", PAGE).unwrap();
    let data = large_rows();

    c.bench_function("engine_render_by_name", |b| {
        b.iter(|| engine.render(black_box("page"), data.clone()).unwrap())
    });
}

criterion_group!(
    benches,
    bench_compile,
    bench_render,
    bench_expressions,
    bench_engine
);
criterion_main!(benches);
