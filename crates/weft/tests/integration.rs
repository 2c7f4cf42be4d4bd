//! Black-box integration tests for weft
//!
//! These tests exercise the full compile → render pipeline.

use serde_json::json;
use weft::advanced::{eval, parse};
use weft::{
    CompileOptions, CompiledTemplate, HelperError, HelperRegistry, LimitType, RenderConfig,
    RenderError, RenderOptions, ResourceLimits, Scope, Value, compile, create_string_renderer,
    evaluate_expression, render, render_source,
};

fn compile_ok(src: &str) -> CompiledTemplate {
    let _ = env_logger::builder().is_test(true).try_init();
    let template = compile(src, &CompileOptions::default());
    assert!(
        !template.has_errors(),
        "unexpected diagnostics for {src:?}: {:?}",
        template.diagnostics
    );
    template
}

fn html(src: &str, data: serde_json::Value) -> String {
    html_with(src, data, &RenderOptions::default())
}

fn html_with(src: &str, data: serde_json::Value, options: &RenderOptions) -> String {
    render(&compile_ok(src), data, options).unwrap().html
}

fn render_err(src: &str, data: serde_json::Value, options: &RenderOptions) -> RenderError {
    render(&compile_ok(src), data, options).unwrap_err()
}

fn limit_type(err: &RenderError) -> LimitType {
    match err {
        RenderError::Limit(e) => e.limit_type,
        RenderError::Eval(weft::EvalError::Limit(e)) => e.limit_type,
        other => panic!("Expected limit error, got {other:?}"),
    }
}

// ============ Expressions ============

#[test]
fn missing_segments_never_throw() {
    let data = json!({"a": null, "b": {"c": []}});
    for src in ["a.b.c", "a[0].x", "b.c[5].d", "nope.deeper.x", "b.c.length"] {
        let value = evaluate_expression(src, data.clone()).unwrap();
        if src.ends_with("length") {
            assert_eq!(value, Value::from(0));
        } else {
            assert!(value.is_nullish(), "{src} gave {value:?}");
        }
    }
}

#[test]
fn nullish_coalescing_is_not_falsy() {
    assert_eq!(evaluate_expression("0 ?? 'd'", json!({})).unwrap(), Value::from(0));
    assert_eq!(evaluate_expression("'' ?? 'd'", json!({})).unwrap(), Value::from(""));
    assert_eq!(evaluate_expression("false ?? 1", json!({})).unwrap(), Value::from(false));
    assert_eq!(evaluate_expression("null ?? 'd'", json!({})).unwrap(), Value::from("d"));
    assert_eq!(evaluate_expression("missing ?? 'd'", json!({})).unwrap(), Value::from("d"));
    // || is falsy-based
    assert_eq!(evaluate_expression("0 || 'd'", json!({})).unwrap(), Value::from("d"));
}

#[test]
fn scope_resolution_precedence() {
    let helpers = HelperRegistry::new();
    let scope = Scope::new(json!({"x": 2})).with_globals(json!({"x": 3}));
    let with_local = scope.with_local("x", 1);

    let bare = parse("$x").unwrap();
    let global = parse("$.x").unwrap();
    assert_eq!(eval(&bare, &with_local, &helpers).unwrap(), Value::from(1));
    assert_eq!(eval(&bare, &scope, &helpers).unwrap(), Value::from(2));
    assert_eq!(eval(&global, &with_local, &helpers).unwrap(), Value::from(3));
    assert_eq!(eval(&global, &scope, &helpers).unwrap(), Value::from(3));
}

#[test]
fn wildcards_flatten_one_level_per_star() {
    let data = json!({"a": [
        {"b": [{"c": 1}, {"c": 2}]},
        {"b": [{"c": 3}]},
        {"b": []}
    ]});
    let value = evaluate_expression("a[*].b[*].c", data).unwrap();
    assert_eq!(value, Value::from(json!([1, 2, 3])));

    let empty = evaluate_expression("nothing[*].x", json!({})).unwrap();
    assert_eq!(empty, Value::from(json!([])));
}

#[test]
fn coercion_table() {
    let cases = [
        ("5 + null", json!(5)),
        ("'5' + 3", json!("53")),
        ("'5' * '2'", json!(10)),
        ("true + 1", json!(2)),
        ("'10' == 10", json!(true)),
        ("null == undefined", json!(true)),
        ("null == 0", json!(false)),
        ("'b' > 'a'", json!(true)),
        ("'' || 'x'", json!("x")),
    ];
    for (src, expected) in cases {
        assert_eq!(
            evaluate_expression(src, json!({})).unwrap(),
            Value::from(expected),
            "{src}"
        );
    }
    let nan = evaluate_expression("5 + undefined", json!({})).unwrap();
    assert!(matches!(nan, Value::Number(n) if n.is_nan()));
}

#[test]
fn parse_errors_are_positioned() {
    let err = evaluate_expression("a + (b", json!({})).unwrap_err();
    assert_eq!(err.code(), "PARSE_ERROR");
}

// ============ Text & Attributes ============

#[test]
fn interpolation_round_trip() {
    assert_eq!(html("<div>${a+b}</div>", json!({"a": 10, "b": 3})), "<div>13</div>");
    assert_eq!(html("<div>${a+b}</div>", json!({"a": "x", "b": 3})), "<div>x3</div>");
    assert_eq!(html("<div>${a}${b}</div>", json!({"a": null})), "<div></div>");
}

#[test]
fn path_shorthand_in_text() {
    assert_eq!(
        html("Hi $user.name!", json!({"user": {"name": "Ada"}})),
        "Hi Ada!"
    );
}

#[test]
fn boolean_and_null_attributes() {
    assert_eq!(html("<button disabled={true}>x</button>", json!({})), "<button disabled>x</button>");
    assert_eq!(html("<button disabled={false}>x</button>", json!({})), "<button>x</button>");
    assert_eq!(html("<input value={null}>", json!({})), "<input />");
    assert_eq!(html("<input value={0}>", json!({})), r#"<input value="0" />"#);
    assert_eq!(html("<input value={v}>", json!({})), "<input />");
}

#[test]
fn attribute_values_are_escaped() {
    assert_eq!(
        html(r#"<a title="a&b" href="/u/${id}?q=${q}">x</a>"#, json!({"id": 7, "q": "\"<>"})),
        r#"<a title="a&amp;b" href="/u/7?q=&quot;&lt;&gt;">x</a>"#
    );
}

#[test]
fn authored_entities_in_attributes_are_kept() {
    assert_eq!(
        html(r#"<a href="?a=1&amp;b=2&#38;c=&#x26;" title="R&D x">x</a>"#, json!({})),
        r#"<a href="?a=1&amp;b=2&#38;c=&#x26;" title="R&amp;D x">x</a>"#
    );
    // mixed: template text keeps its entities, values are escaped in full
    assert_eq!(
        html(r#"<a href="?a=1&amp;q=${q}">x</a>"#, json!({"q": "&amp;"})),
        r#"<a href="?a=1&amp;q=&amp;amp;">x</a>"#
    );
}

#[test]
fn escaping_can_be_disabled_for_text() {
    let options = RenderOptions::new().with_config(RenderConfig::new().without_escaping());
    assert_eq!(html_with("<p>${x}</p>", json!({"x": "<b>"}), &options), "<p><b></p>");
}

#[test]
fn style_braces_with_interpolation() {
    let src = "<style>body { font-family: ${fontFamily ?? 'Arial'}; }</style>";
    let template = compile(src, &CompileOptions::default());
    assert!(template.diagnostics.is_empty());

    let out = render(&template, json!({}), &RenderOptions::default()).unwrap();
    assert_eq!(out.html, "<style>body { font-family: Arial; }</style>");
    let out = render(&template, json!({"fontFamily": "Inter"}), &RenderOptions::default()).unwrap();
    assert_eq!(out.html, "<style>body { font-family: Inter; }</style>");
}

#[test]
fn style_inside_directive_block() {
    let src = "@if (dark) {<style>.x { color: ${color}; }</style>}";
    assert_eq!(
        html(src, json!({"dark": true, "color": "#000"})),
        "<style>.x { color: #000; }</style>"
    );
}

#[test]
fn whitespace_between_tags() {
    let src = "<ul>\n  <li>a</li>\n  <li>b</li>\n</ul>";
    assert_eq!(html(src, json!({})), "<ul><li>a</li><li>b</li></ul>");

    let options = RenderOptions::new().with_config(RenderConfig::new().preserving_whitespace());
    assert_eq!(html_with(src, json!({}), &options), src);

    assert_eq!(html("<pre>\n<b>x</b>\n</pre>", json!({})), "<pre>\n<b>x</b>\n</pre>");
    assert_eq!(html("<>\n<b>x</b>\n</>", json!({})), "\n<b>x</b>\n");
    // inline spacing is content
    assert_eq!(html("<b>a</b> <i>b</i>", json!({})), "<b>a</b> <i>b</i>");
}

#[test]
fn comments_are_opt_in() {
    let src = "<!-- note -->\n// hidden\n<p>x</p>";
    assert_eq!(html(src, json!({})), "<p>x</p>");
    let options = RenderOptions::new().with_config(RenderConfig::new().with_comments());
    assert_eq!(html_with(src, json!({}), &options), "<!-- note --><p>x</p>");
}

#[test]
fn escapes_render_literally() {
    assert_eq!(html("@@name @{x@} \\${y}", json!({"y": 1})), "@name {x} ${y}");
}

// ============ Directives ============

#[test]
fn if_else_chains() {
    let src = "@if (n > 10) {big} @else if (n > 0) {small} @else {none}";
    assert_eq!(html(src, json!({"n": 20})), "big");
    assert_eq!(html(src, json!({"n": 5})), "small");
    assert_eq!(html(src, json!({"n": -1})), "none");
    assert_eq!(html("@if (n) {x}", json!({"n": 0})), "");
}

#[test]
fn for_loops() {
    assert_eq!(html("@for (x of xs) {<i>${x}</i>}", json!({"xs": []})), "");
    assert_eq!(
        html("@for (x, i of xs) {${i}:${x};}", json!({"xs": ["a", "b"]})),
        "0:a;1:b;"
    );
    assert_eq!(html("@for (k in obj) {${k},}", json!({"obj": {"a": 1, "b": 2}})), "a,b,");
    assert_eq!(html("@for (k in xs) {${k},}", json!({"xs": ["p", "q"]})), "0,1,");
    // non-arrays render nothing
    assert_eq!(html("@for (x of xs) {${x}}", json!({"xs": {"a": 1}})), "");
    assert_eq!(html("@for (k in xs) {${k}}", json!({"xs": null})), "");
}

#[test]
fn loop_variables_do_not_leak() {
    assert_eq!(
        html("@for (x of xs) {${x}}[${x}]", json!({"xs": [1, 2], "x": "outer"})),
        "12[outer]"
    );
}

#[test]
fn match_cases_in_order() {
    let src = r#"@match (status) { "ok", "done" => {green} _ > 3 => {big} 1 => {one} _ => {other} }"#;
    assert_eq!(html(src, json!({"status": "done"})), "green");
    assert_eq!(html(src, json!({"status": 5})), "big");
    assert_eq!(html(src, json!({"status": 1})), "one");
    // strict equality: "1" is not 1
    assert_eq!(html(src, json!({"status": "1"})), "other");
}

#[test]
fn let_binds_for_later_siblings_only() {
    assert_eq!(html("@let total = price * qty;${total}", json!({"price": 2, "qty": 3})), "6");
    assert_eq!(html("${x}@let x = 1;${x}", json!({"x": 0})), "01");
    assert_eq!(html("@if (true) {@let y = 1;${y}}[${y}]", json!({})), "1[]");
}

#[test]
fn let_functions_and_recursion() {
    let src = "@let fact(n) = n <= 1 ? 1 : n * fact(n - 1);${fact(5)}";
    assert_eq!(html(src, json!({})), "120");

    let src = "@let rate = 2;\n@let scale(x) = x * rate;\n${scale(21)}";
    assert_eq!(html(src, json!({})), "42");

    let err = render_err("@let f(n) = f(n + 1);${f(0)}", json!({}), &RenderOptions::default());
    assert_eq!(err.code(), "FUNCTION_CALL_DEPTH_EXCEEDED");
    assert_eq!(limit_type(&err), LimitType::FunctionCallDepth);
}

#[test]
fn global_let_crosses_component_boundary() {
    let src = "<template:Theme>${$.theme}</template:Theme>@let $.theme = 'dark';<Theme />";
    assert_eq!(html(src, json!({})), "dark");
}

// ============ Components & Slots ============

const CARD: &str = r#"<template:Card title size="md"><div class="card ${size}"><h1>${title}</h1><slot /><footer><slot name="footer">none</slot></footer></div></template:Card>"#;

#[test]
fn component_props_defaults_and_slots() {
    let src = format!(
        "{CARD}\n<Card title=${{heading}}>Body<template slot=\"footer\">F</template></Card>"
    );
    assert_eq!(
        html(&src, json!({"heading": "Hi"})),
        r#"<div class="card md"><h1>Hi</h1>Body<footer>F</footer></div>"#
    );

    let src = format!("{CARD}\n<Card title=\"x\" size=\"lg\"></Card>");
    assert_eq!(
        html(&src, json!({})),
        r#"<div class="card lg"><h1>x</h1><footer>none</footer></div>"#
    );
}

#[test]
fn component_scope_is_isolated() {
    let src = "<template:Show>[${secret}]</template:Show>@let secret = 1;<Show />";
    assert_eq!(html(src, json!({"secret": 2})), "[]");

    let src = "<template:Show>[${secret}]</template:Show><Show secret=${secret} />";
    assert_eq!(html(src, json!({"secret": 2})), "[2]");
}

#[test]
fn globals_reach_components() {
    let options = RenderOptions::new().with_globals(json!({"site": "weft"}));
    let src = "<template:Footer>${$.site}</template:Footer><Footer />";
    assert_eq!(html_with(src, json!({}), &options), "weft");
}

#[test]
fn defaults_see_earlier_props_and_extra_props_pass_through() {
    let src = "<template:D a b={a + 1}>${b}/${extra}</template:D><D a={1} extra=\"y\" />";
    assert_eq!(html(src, json!({})), "2/y");
}

#[test]
fn slot_content_renders_in_component_scope() {
    // `label` exists only as the component's prop
    let src = "<template:Box label><b><slot /></b></template:Box><Box label=\"L\">${label}</Box>";
    assert_eq!(html(src, json!({"label": "caller"})), "<b>L</b>");
}

#[test]
fn nested_components_forward_slots() {
    let src = r#"<template:Inner><i><slot /></i></template:Inner><template:Outer><Inner><slot /></Inner></template:Outer><Outer>deep</Outer>"#;
    assert_eq!(html(src, json!({})), "<i>deep</i>");
}

#[test]
fn external_components() {
    let defs = compile_ok("<template:Tag v>#${v}</template:Tag>");
    let mut options = RenderOptions::new();
    for def in defs.components.values() {
        options = options.with_component(def.clone());
    }
    assert_eq!(html_with("<Tag v=\"x\" />", json!({}), &options), "#x");
}

#[test]
fn unknown_component_is_a_render_error() {
    let err = render_err("<p><Nope /></p>", json!({}), &RenderOptions::default());
    assert_eq!(err.code(), "UNKNOWN_COMPONENT");
    assert_eq!(err.location().unwrap().start.column, 4);
}

// ============ Limits ============

#[test]
fn loop_nesting_limit() {
    let limits = ResourceLimits {
        max_loop_nesting: 2,
        ..ResourceLimits::default()
    };
    let options = RenderOptions::new().with_limits(limits);
    let src = "@for (x of a) {@for (y of x) {@for (z of y) {${z}}}}";
    let data = json!({"a": [[[1]]]});

    let err = render_err(src, data.clone(), &options);
    assert_eq!(err.code(), "LOOP_NESTING_EXCEEDED");
    let RenderError::Limit(limit) = &err else {
        panic!("Expected limit error");
    };
    assert_eq!(limit.limit_type, LimitType::LoopNesting);
    assert_eq!((limit.current, limit.max), (3, 2));

    assert_eq!(html(src, data), "1");
}

#[test]
fn iteration_limits() {
    let per_loop = RenderOptions::new().with_limits(ResourceLimits {
        max_iterations_per_loop: 3,
        ..ResourceLimits::default()
    });
    let err = render_err("@for (x of xs) {${x}}", json!({"xs": [1, 2, 3, 4, 5]}), &per_loop);
    assert_eq!(err.code(), "ITERATION_LIMIT_EXCEEDED");
    assert_eq!(limit_type(&err), LimitType::IterationsPerLoop);

    let total = RenderOptions::new().with_limits(ResourceLimits {
        max_total_iterations: 4,
        ..ResourceLimits::default()
    });
    let err = render_err(
        "@for (row of rows) {@for (x of row) {${x}}}",
        json!({"rows": [[1, 2, 3], [4, 5, 6]]}),
        &total,
    );
    assert_eq!(limit_type(&err), LimitType::TotalIterations);
}

#[test]
fn component_depth_limit() {
    let src = "<template:Loop><Loop /></template:Loop><Loop />";
    let err = render_err(src, json!({}), &RenderOptions::default());
    assert_eq!(err.code(), "COMPONENT_DEPTH_EXCEEDED");
}

#[test]
fn recursion_depth_limit() {
    let options = RenderOptions::new().with_limits(ResourceLimits {
        max_recursion_depth: 3,
        ..ResourceLimits::default()
    });
    let err = render_err("<a><b><i><u>x</u></i></b></a>", json!({}), &options);
    assert_eq!(err.code(), "RECURSION_DEPTH_EXCEEDED");
    assert_eq!(html_with("<a><b>x</b></a>", json!({}), &options), "<a><b>x</b></a>");
}

// ============ Helpers ============

#[test]
fn builtin_helpers() {
    assert_eq!(html("${upper(name)}", json!({"name": "ada"})), "ADA");
    assert_eq!(html("${join(tags, ', ')}", json!({"tags": ["a", "b"]})), "a, b");
    assert_eq!(html("${round(3.14159, 2)}", json!({})), "3.14");
    assert_eq!(html("${json(o)}", json!({"o": {"a": [1]}})), "{&quot;a&quot;:[1]}");
}

#[test]
fn curried_helpers_read_globals() {
    let mut helpers = HelperRegistry::with_builtins();
    helpers.register("greet", |scope| {
        let user = scope.global("user");
        Box::new(move |args: &[Value]| {
            let greeting = args.first().cloned().unwrap_or_default();
            Ok(Value::from(format!(
                "{}, {}",
                greeting.to_output_string(),
                user.to_output_string()
            )))
        })
    });
    let options = RenderOptions::new()
        .with_helpers(helpers)
        .with_globals(json!({"user": "Ada", "currency": "EUR", "locale": "de-DE"}));
    assert_eq!(html_with("${greet('Hi')}", json!({}), &options), "Hi, Ada");
    assert_eq!(html_with("${currency(p)}", json!({"p": 1234.5}), &options), "1.234,50 €");
}

#[test]
fn helper_failures_propagate() {
    let err = render_err("${nope(1)}", json!({}), &RenderOptions::default());
    assert_eq!(err.code(), "UNKNOWN_HELPER");

    let mut helpers = HelperRegistry::new();
    helpers.register_fn("fail", |_| Err(HelperError::new("boom")));
    let options = RenderOptions::new().with_helpers(helpers);
    let err = render_err("<p>${fail()}</p>", json!({}), &options);
    assert_eq!(err.code(), "HELPER_FAILED");
    assert!(err.to_string().contains("boom"));
}

// ============ Source Tracking ============

#[test]
fn source_tracking_attributes() {
    let options =
        RenderOptions::new().with_config(RenderConfig::new().with_source_tracking("rd-"));
    assert_eq!(
        html_with(
            "<p class=${cls}>${upper(name)}</p>",
            json!({"cls": "x", "name": "x"}),
            &options
        ),
        r#"<p class="x" rd-source="cls,name" rd-source-op="upper" rd-source-note="upper(name)">X</p>"#
    );

    let bare = RenderOptions::new().with_config(RenderConfig::new().with_source_tracking(""));
    assert_eq!(
        html_with("<p>${a}</p><br>", json!({"a": 1}), &bare),
        r#"<p source="a">1</p><br />"#
    );
}

#[test]
fn source_tracking_reports_data_paths_only() {
    let options =
        RenderOptions::new().with_config(RenderConfig::new().with_source_tracking("rd-"));
    let src = "<ul>@for (u, i in users) {<li>${i}</li>}@for (u of users) {@let label = upper(u.name);<li title=${label}>${u.name}</li>}</ul>";
    let out = render(
        &compile_ok(src),
        json!({"users": [{"name": "a"}]}),
        &options,
    )
    .unwrap();
    assert_eq!(
        out.html,
        r#"<ul><li>0</li><li title="A" rd-source="users[*].name">a</li></ul>"#
    );
    assert_eq!(
        out.metadata.paths_accessed.iter().collect::<Vec<_>>(),
        vec!["users", "users[*].name"]
    );

    // `@let` in the children is not data either
    let out = render(
        &compile_ok("<p>@let n = 2;${n} ${m}</p>"),
        json!({"m": 1}),
        &options,
    )
    .unwrap();
    assert_eq!(out.html, r#"<p rd-source="m">2 1</p>"#);
}

#[test]
fn invalid_prefix_fails_before_rendering() {
    let options =
        RenderOptions::new().with_config(RenderConfig::new().with_source_tracking("1-bad"));
    let err = render_err("${boom()}", json!({}), &options);
    assert_eq!(err.code(), "INVALID_CONFIG");
}

// ============ Pipeline ============

#[test]
fn templates_with_errors_are_refused() {
    let template = compile("<div>${a +}</div>", &CompileOptions::default());
    assert!(template.has_errors());
    let err = render(&template, json!({}), &RenderOptions::default()).unwrap_err();
    assert_eq!(err.code(), "INVALID_TEMPLATE");

    let err = render_source("<b>${ )}</b>", json!({}), &RenderOptions::default()).unwrap_err();
    assert_eq!(err.code(), "INVALID_TEMPLATE");
    assert!(create_string_renderer(template).is_err());
}

#[test]
fn deeply_nested_expressions_become_diagnostics() {
    let parens = format!("<p>${{{}x{}}}</p>", "(".repeat(10_000), ")".repeat(10_000));
    let nots = format!("<p>${{{}x}}</p>", "!".repeat(10_000));
    for src in [parens, nots] {
        let template = compile(&src, &CompileOptions::default());
        let error = template.errors().next().expect("an error diagnostic");
        assert_eq!(error.code, Some("INVALID_EXPRESSION"));
        assert!(error.message.contains("nested too deeply"));
    }
}

#[test]
fn rendering_is_idempotent() {
    let template = compile_ok(&format!(
        "{CARD}@for (x, i of xs) {{<Card title=${{x}}>${{i}}</Card>}}@let n = len(xs);${{n}}"
    ));
    let before = template.root.clone();
    let data = json!({"xs": ["a", "b"]});

    let first = render(&template, data.clone(), &RenderOptions::default()).unwrap();
    let second = render(&template, data, &RenderOptions::default()).unwrap();
    assert_eq!(first.html, second.html);
    assert_eq!(template.root, before);
}

#[test]
fn string_renderer_factory() {
    let renderer = create_string_renderer(compile_ok("<b>${x}</b>")).unwrap();
    let options = RenderOptions::default();
    assert_eq!(renderer(Value::from(json!({"x": 1})), &options).unwrap().html, "<b>1</b>");
    assert_eq!(renderer(Value::from(json!({"x": 2})), &options).unwrap().html, "<b>2</b>");
}

#[test]
fn render_metadata() {
    let template = compile_ok("@for (u of users) {${upper(u.name)}}");
    let out = render(
        &template,
        json!({"users": [{"name": "a"}, {"name": "b"}]}),
        &RenderOptions::default(),
    )
    .unwrap();
    assert_eq!(out.html, "AB");
    let meta = &out.metadata;
    assert_eq!(
        meta.paths_accessed.iter().collect::<Vec<_>>(),
        vec!["users", "users[*].name"]
    );
    assert!(meta.helpers_called.contains("upper"));
    assert_eq!(meta.total_iterations, 2);
    assert_eq!(meta.max_loop_nesting, 1);
    assert!(meta.max_recursion_depth >= 2);
    assert_eq!(meta.max_component_depth, 0);

    let json = serde_json::to_value(meta).unwrap();
    assert_eq!(json["totalIterations"], 2);
}

#[test]
fn compiled_templates_render_from_many_threads() {
    let template = compile_ok("<p>${n * 2}</p>");
    std::thread::scope(|s| {
        for n in 0..4 {
            let template = &template;
            s.spawn(move || {
                let out = render(template, json!({"n": n}), &RenderOptions::default()).unwrap();
                assert_eq!(out.html, format!("<p>{}</p>", n * 2));
            });
        }
    });
}
