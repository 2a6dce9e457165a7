//! Macros, call blocks, imports, and module scoping.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tessera::{DictLoader, Environment, Object};

fn env_with(templates: Vec<(&str, &str)>) -> Environment {
    let mut env = Environment::new();
    env.set_loader(templates.into_iter().collect::<DictLoader>());
    env
}

fn render(source: &str) -> String {
    Environment::new().render_string(source, "test", IndexMap::new()).unwrap()
}

#[test]
fn macro_with_default_argument() {
    let source = "{% macro g(n, s='Hi') %}{{ s }}, {{ n }}!{% endmacro %}{{ g('W') }}{{ g('W', s='Yo') }}";
    assert_eq!(render(source), "Hi, W!Yo, W!");
}

#[test]
fn macro_defaults_evaluate_at_call_time() {
    let source = "{% set greeting = 'a' %}{% macro m(x=greeting) %}{{ x }}{% endmacro %}\
                  {% set greeting = 'b' %}{{ m() }}";
    // the default expression reads the defining scope as it is at call time
    assert_eq!(render(source), "b");
}

#[test]
fn varargs_and_kwargs_collect_extras() {
    let source = "{% macro m(a) %}{{ a }}|{{ varargs | join(',') }}|{{ kwargs['k'] }}{% endmacro %}{{ m(1, 2, 3, k=4) }}";
    assert_eq!(render(source), "1|2,3|4");
}

#[test]
fn caller_is_undefined_outside_call_blocks() {
    let source = "{% macro m() %}{{ 'y' if caller is defined else 'n' }}{% endmacro %}{{ m() }}";
    assert_eq!(render(source), "n");
}

#[test]
fn call_block_provides_caller() {
    let source = "{% macro wrap() %}<{{ caller() }}>{% endmacro %}{% call wrap() %}body{% endcall %}";
    assert_eq!(render(source), "<body>");
}

#[test]
fn call_block_with_parameters() {
    let source = "{% macro each(items) %}{% for i in items %}{{ caller(i) }}{% endfor %}{% endmacro %}\
                  {% call(x) each([1, 2]) %}[{{ x }}]{% endcall %}";
    assert_eq!(render(source), "[1][2]");
}

#[test]
fn macro_closure_sees_later_mutations() {
    let source = "{% set ns = namespace(v='old') %}{% macro show() %}{{ ns.v }}{% endmacro %}\
                  {% set ns.v = 'new' %}{{ show() }}";
    assert_eq!(render(source), "new");
}

#[test]
fn macro_output_is_not_autoescaped_twice() {
    let mut env = Environment::new();
    env.set_autoescape(tessera::Autoescape::On);
    let source = "{% macro m(v) %}<b>{{ v }}</b>{% endmacro %}{{ m('&') }}";
    let out = env.render_string(source, "t", IndexMap::new()).unwrap();
    // the macro body escaped its interpolation; the macro result stays as-is
    assert_eq!(out, "<b>&amp;</b>");
}

#[test]
fn macro_invoked_as_statement_emits() {
    let source = "{% macro m() %}x{% endmacro %}a{{ m() }}b";
    assert_eq!(render(source), "axb");
}

#[test]
fn import_binds_module_namespace() {
    let env = env_with(vec![(
        "helpers",
        "{% macro shout(x) %}{{ x | upper }}!{% endmacro %}{% set version = 3 %}",
    )]);
    let out = env
        .render_string("{% import 'helpers' as h %}{{ h.shout('hi') }}{{ h.version }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "HI!3");
}

#[test]
fn from_import_with_alias() {
    let env = env_with(vec![(
        "helpers",
        "{% macro shout(x) %}{{ x | upper }}!{% endmacro %}",
    )]);
    let out = env
        .render_string("{% from 'helpers' import shout as s %}{{ s('ok') }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "OK!");
}

#[test]
fn import_without_context_hides_caller_variables() {
    let env = env_with(vec![("who", "{% macro who() %}{{ name }}{% endmacro %}")]);
    let vars: IndexMap<String, Object> = [("name".to_owned(), Object::from("Z"))].into_iter().collect();
    let out = env
        .render_string("{% from 'who' import who %}[{{ who() }}]", "t", vars.clone())
        .unwrap();
    assert_eq!(out, "[]");

    let out = env
        .render_string("{% from 'who' import who with context %}[{{ who() }}]", "t", vars)
        .unwrap();
    assert_eq!(out, "[Z]");
}

#[test]
fn import_does_not_render_template_body() {
    let env = env_with(vec![("noisy", "NOISE{% set x = 1 %}")]);
    let out = env
        .render_string("{% import 'noisy' as n %}{{ n.x }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "1");
}

#[test]
fn underscore_names_are_not_exported() {
    let env = env_with(vec![("m", "{% set _private = 1 %}{% set public = 2 %}")]);
    let out = env
        .render_string("{% import 'm' as m %}{{ m._private | default('hidden') }}{{ m.public }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "hidden2");
}

#[test]
fn missing_export_is_an_error() {
    let env = env_with(vec![("m", "{% set a = 1 %}")]);
    let err = env
        .render_string("{% from 'm' import nothing %}", "t", IndexMap::new())
        .unwrap_err();
    assert!(err.message().contains("nothing"));
}

#[test]
fn imported_macro_keeps_module_scope() {
    let env = env_with(vec![(
        "mod",
        "{% set prefix = '>' %}{% macro line(x) %}{{ prefix }}{{ x }}{% endmacro %}",
    )]);
    let out = env
        .render_string("{% from 'mod' import line %}{{ line('a') }}{{ line('b') }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, ">a>b");
}
