//! End-to-end rendering: expressions, control flow, loop state, scoping.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tessera::{Environment, Object};

fn ctx(pairs: Vec<(&str, Object)>) -> IndexMap<String, Object> {
    pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

fn render(source: &str) -> String {
    render_vars(source, vec![])
}

fn render_vars(source: &str, vars: Vec<(&str, Object)>) -> String {
    let env = Environment::new();
    env.render_string(source, "test", ctx(vars)).unwrap()
}

#[test]
fn literal_text_renders_unchanged() {
    assert_eq!(render("hello world"), "hello world");
}

#[test]
fn for_over_range() {
    assert_eq!(render("{% for i in range(3) %}{{ i }}{% endfor %}"), "012");
}

#[test]
fn if_elif_else_dispatch() {
    let source = "{% if x == 2 %}two{% elif x == 1 %}one{% else %}?{% endif %}";
    assert_eq!(render_vars(source, vec![("x", Object::Int(2))]), "two");
    assert_eq!(render_vars(source, vec![("x", Object::Int(1))]), "one");
    assert_eq!(render_vars(source, vec![("x", Object::Int(7))]), "?");
}

#[test]
fn set_and_slice() {
    let source = "{% set xs = [1,2,3,4,5] %}{% set xs = xs[1:] %}{{ xs | join(',') }}";
    assert_eq!(render(source), "2,3,4,5");
}

#[test]
fn loop_cycle_alternates() {
    let source = "{% for i in items %}{{ loop.cycle('odd','even') }}{% endfor %}";
    let items = Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3), Object::Int(4)]);
    assert_eq!(render_vars(source, vec![("items", items)]), "oddevenoddeven");
}

#[test]
fn loop_object_identities() {
    let source = "{% for x in 'abc' %}{{ loop.index }}:{{ loop.index0 }}:{{ loop.revindex }}:{{ loop.length }};{% endfor %}";
    assert_eq!(render(source), "1:0:3:3;2:1:2:3;3:2:1:3;");
}

#[test]
fn loop_first_last_flags() {
    let source = "{% for x in [1,2,3] %}{% if loop.first %}<{% endif %}{{ x }}{% if loop.last %}>{% endif %}{% endfor %}";
    assert_eq!(render(source), "<123>");
}

#[test]
fn loop_prev_and_next_items() {
    let source = "{% for x in 'abc' %}{{ loop.previtem }}{{ x }}{% endfor %}";
    assert_eq!(render(source), "aabbc");
}

#[test]
fn nested_loop_depth() {
    let source = "{% for i in range(2) %}{% for j in range(2) %}{{ loop.depth }}{% endfor %}{% endfor %}";
    assert_eq!(render(source), "2222");
}

#[test]
fn loop_variable_does_not_leak() {
    let source = "{% set i = 9 %}{% for i in range(3) %}{{ i }}{% endfor %}{{ i }}";
    assert_eq!(render(source), "0129");
}

#[test]
fn for_else_runs_on_empty_iterable() {
    assert_eq!(render("{% for x in [] %}x{% else %}none{% endfor %}"), "none");
    assert_eq!(render("{% for x in [1] %}x{% else %}none{% endfor %}"), "x");
}

#[test]
fn break_stops_iteration() {
    let source = "{% for i in range(5) %}{% if i == 3 %}{% break %}{% endif %}{{ i }}{% endfor %}";
    assert_eq!(render(source), "012");
}

#[test]
fn continue_skips_item() {
    let source = "{% for i in range(5) %}{% if i == 2 %}{% continue %}{% endif %}{{ i }}{% endfor %}";
    assert_eq!(render(source), "0134");
}

#[test]
fn inline_for_filter_renumbers_loop() {
    let source = "{% for i in range(5) if i % 2 == 0 %}{{ i }}({{ loop.index }}){% endfor %}";
    assert_eq!(render(source), "0(1)2(2)4(3)");
}

#[test]
fn for_unpacks_pairs() {
    let source = "{% for k, v in d.items() %}{{ k }}={{ v }};{% endfor %}";
    let mut map = IndexMap::new();
    map.insert("a".to_owned(), Object::Int(1));
    map.insert("b".to_owned(), Object::Int(2));
    assert_eq!(render_vars(source, vec![("d", Object::Map(map))]), "a=1;b=2;");
}

#[test]
fn iterating_a_dict_yields_keys_in_order() {
    let source = "{% for k in d %}{{ k }}{% endfor %}";
    let mut map = IndexMap::new();
    map.insert("z".to_owned(), Object::Int(1));
    map.insert("a".to_owned(), Object::Int(2));
    assert_eq!(render_vars(source, vec![("d", Object::Map(map))]), "za");
}

#[test]
fn with_scope_sees_earlier_bindings() {
    let source = "{% with a = 1, b = a + 1 %}{{ a }}{{ b }}{% endwith %}{{ a }}";
    assert_eq!(render(source), "12");
}

#[test]
fn set_inside_untaken_branch_does_not_bind() {
    let source = "{% if false %}{% set v = 1 %}{% endif %}{{ v | default('d') }}";
    assert_eq!(render(source), "d");
}

#[test]
fn set_block_captures_output() {
    let source = "{% set x %}A{{ 1 + 1 }}{% endset %}{{ x }}{{ x }}";
    assert_eq!(render(source), "A2A2");
}

#[test]
fn namespace_survives_loop_scoping() {
    let source =
        "{% set ns = namespace(c=0) %}{% for i in range(3) %}{% set ns.c = ns.c + 1 %}{% endfor %}{{ ns.c }}";
    assert_eq!(render(source), "3");
}

#[test]
fn do_evaluates_for_side_effects() {
    let source = "{% set xs = [1] %}{% do xs.append(2) %}{{ xs | join(',') }}";
    assert_eq!(render(source), "1,2");
}

#[test]
fn arithmetic_operators() {
    assert_eq!(render("{{ 7 // 2 }} {{ 7 % 2 }} {{ 2 ** 3 }} {{ 7 / 2 }}"), "3 1 8 3.5");
    assert_eq!(render("{{ -7 // 2 }} {{ -7 % 3 }}"), "-4 2");
}

#[test]
fn concat_stringifies_operands() {
    assert_eq!(render("{{ 1 ~ 'x' ~ none }}"), "1xNone");
}

#[test]
fn string_and_list_repetition() {
    assert_eq!(render("{{ 'ab' * 3 }}"), "ababab");
    assert_eq!(render("{{ [1, 2] + [3] }}"), "[1, 2, 3]");
}

#[test]
fn comparison_chain_through_booleans() {
    assert_eq!(render("{{ 1 < 2 and 'a' in 'cab' and not false }}"), "True");
    assert_eq!(render("{{ 'x' not in 'abc' }}"), "True");
}

#[test]
fn in_on_dict_checks_keys_not_values() {
    let source = "{{ 'a' in d }}|{{ 1 in d }}";
    let mut map = IndexMap::new();
    map.insert("a".to_owned(), Object::Int(1));
    assert_eq!(render_vars(source, vec![("d", Object::Map(map))]), "True|False");
}

#[test]
fn conditional_expression_with_and_without_else() {
    assert_eq!(render("{{ 'a' if true else 'b' }}"), "a");
    assert_eq!(render("{{ 'a' if false else 'b' }}"), "b");
    assert_eq!(render("{{ 'a' if false }}"), "");
}

#[test]
fn short_circuit_keeps_operand_value() {
    assert_eq!(render("{{ false or 'fallback' }}"), "fallback");
    assert_eq!(render("{{ none and crash_never_evaluated }}"), "None");
}

#[test]
fn string_methods_chain() {
    assert_eq!(render("{{ '  hi  '.strip().upper() }}"), "HI");
    assert_eq!(render("{{ 'a,b,c'.split(',') | join('+') }}"), "a+b+c");
    assert_eq!(render("{{ 'hello'.startswith('he') }}"), "True");
    assert_eq!(render("{{ 'hello'.replace('l', 'L', 1) }}"), "heLlo");
}

#[test]
fn subscripts_wrap_negative_indices() {
    assert_eq!(render("{{ [10, 20, 30][-1] }}"), "30");
    assert_eq!(render("{{ 'abc'[1] }}"), "b");
    assert_eq!(render("{{ range(10)[2:8:3] | join(',') }}"), "2,5");
}

#[test]
fn undefined_renders_empty_and_chains() {
    assert_eq!(render("[{{ missing }}]"), "[]");
    assert_eq!(render("[{{ missing.deeply.nested }}]"), "[]");
    assert_eq!(render("{{ 'y' if missing else 'n' }}"), "n");
}

#[test]
fn autoescape_block_overrides_environment() {
    let source = "{% autoescape true %}{{ '<b>' }}{% endautoescape %}{{ '<b>' }}";
    assert_eq!(render(source), "&lt;b&gt;<b>");
}

#[test]
fn autoescape_environment_and_safe_filter() {
    let mut env = Environment::new();
    env.set_autoescape(tessera::Autoescape::On);
    let out = env.render_string("{{ v }}|{{ v | safe }}", "t", ctx(vec![("v", Object::from("<b>"))])).unwrap();
    assert_eq!(out, "&lt;b&gt;|<b>");
}

#[test]
fn autoescape_callback_decides_per_template_name() {
    let mut env = Environment::new();
    env.set_autoescape(tessera::Autoescape::Callback(std::sync::Arc::new(|name: &str| {
        name.ends_with(".html")
    })));
    let vars = ctx(vec![("v", Object::from("<b>"))]);
    assert_eq!(env.render_string("{{ v }}", "page.html", vars.clone()).unwrap(), "&lt;b&gt;");
    assert_eq!(env.render_string("{{ v }}", "page.txt", vars).unwrap(), "<b>");
}

#[test]
fn cycler_and_joiner_globals() {
    assert_eq!(render("{% set c = cycler('a','b') %}{{ c() }}{{ c() }}{{ c() }}"), "aba");
    assert_eq!(render("{% set j = joiner('|') %}{{ j() }}x{{ j() }}y"), "x|y");
}

#[test]
fn filter_block_applies_chain() {
    assert_eq!(render("{% filter upper %}abc{% endfilter %}"), "ABC");
    assert_eq!(render("{% filter upper | reverse %}abc{% endfilter %}"), "CBA");
}

#[test]
fn bool_and_none_render_python_style() {
    assert_eq!(render("{{ true }} {{ false }} {{ none }}"), "True False None");
    assert_eq!(render("{{ 1.0 }} {{ 2.5 }}"), "1.0 2.5");
}

#[test]
fn tuple_literal_in_membership() {
    assert_eq!(render("{{ 'a' in ('a', 'b') }}"), "True");
}

#[test]
fn strftime_now_renders_a_year() {
    let out = render("{{ strftime_now('%Y') }}");
    assert_eq!(out.len(), 4);
    assert!(out.parse::<i32>().unwrap() > 2020);
}

#[test]
fn lipsum_word_count() {
    let out = render("{{ lipsum(n=1, html=false, min=5, max=5) }}");
    assert_eq!(out.split_whitespace().count(), 5);
}

#[test]
fn host_global_fn_is_callable() {
    let mut env = Environment::new();
    env.add_global_fn("double", |pos, _| {
        let Some(Object::Int(v)) = pos.first() else {
            return Ok(Object::None);
        };
        Ok(Object::Int(v * 2))
    });
    assert_eq!(env.render_string("{{ double(21) }}", "t", IndexMap::new()).unwrap(), "42");
}

#[test]
fn host_global_value_resolves() {
    let mut env = Environment::new();
    env.add_global("brand", "tessera");
    assert_eq!(env.render_string("{{ brand }}", "t", IndexMap::new()).unwrap(), "tessera");
}

#[test]
fn environment_is_reusable_across_renders() {
    let env = Environment::new();
    for i in 0..3 {
        let out = env
            .render_string("{{ n * 2 }}", "t", ctx(vec![("n", Object::Int(i))]))
            .unwrap();
        assert_eq!(out, (i * 2).to_string());
    }
}
