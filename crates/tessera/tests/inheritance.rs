//! Template inheritance: blocks, super chains, required and scoped blocks,
//! include, and cycle detection.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tessera::{DictLoader, Environment, ErrorKind, Object};

fn env_with(templates: Vec<(&str, &str)>) -> Environment {
    let mut env = Environment::new();
    env.set_loader(templates.into_iter().collect::<DictLoader>());
    env
}

fn render(env: &Environment, source: &str) -> String {
    env.render_string(source, "child", IndexMap::new()).unwrap()
}

#[test]
fn child_overrides_parent_block_with_super() {
    let env = env_with(vec![("p", "A[{% block b %}P{% endblock %}]")]);
    let out = render(&env, "{% extends 'p' %}{% block b %}C-{{ super() }}{% endblock %}");
    assert_eq!(out, "A[C-P]");
}

#[test]
fn unoverridden_blocks_keep_parent_content() {
    let env = env_with(vec![("p", "{% block a %}pa{% endblock %}|{% block b %}pb{% endblock %}")]);
    let out = render(&env, "{% extends 'p' %}{% block a %}ca{% endblock %}");
    assert_eq!(out, "ca|pb");
}

#[test]
fn override_without_super_drops_parent_body() {
    let env = env_with(vec![("p", "[{% block b %}parent text{% endblock %}]")]);
    let out = render(&env, "{% extends 'p' %}{% block b %}child{% endblock %}");
    assert_eq!(out, "[child]");
}

#[test]
fn three_level_super_chain() {
    let env = env_with(vec![
        ("g", "G[{% block a %}g{% endblock %}]"),
        ("p", "{% extends 'g' %}{% block a %}p-{{ super() }}{% endblock %}"),
    ]);
    let out = render(&env, "{% extends 'p' %}{% block a %}c-{{ super() }}{% endblock %}");
    assert_eq!(out, "G[c-p-g]");
}

#[test]
fn blocks_render_without_inheritance() {
    let env = Environment::new();
    let out = env
        .render_string("a{% block b %}inner{% endblock %}c", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "ainnerc");
}

#[test]
fn top_level_set_in_child_is_visible_to_blocks() {
    let env = env_with(vec![("p", "{% block b %}{% endblock %}")]);
    let out = render(&env, "{% extends 'p' %}{% set greeting = 'hi' %}{% block b %}{{ greeting }}{% endblock %}");
    assert_eq!(out, "hi");
}

#[test]
fn scoped_block_sees_loop_variable() {
    let env = env_with(vec![(
        "p",
        "{% for i in range(2) %}{% block item scoped %}{{ i }}{% endblock %}{% endfor %}",
    )]);
    let out = render(&env, "{% extends 'p' %}{% block item scoped %}<{{ i }}>{% endblock %}");
    assert_eq!(out, "<0><1>");
}

#[test]
fn unscoped_block_does_not_see_loop_variable() {
    let env = env_with(vec![(
        "p",
        "{% for i in range(2) %}{% block item %}[{{ i }}]{% endblock %}{% endfor %}",
    )]);
    let out = env.render_template("p", IndexMap::new()).unwrap();
    assert_eq!(out, "[][]");
}

#[test]
fn required_block_must_be_overridden() {
    let env = env_with(vec![("p", "x{% block must required %}  {% endblock %}y")]);
    let err = env.render_template("p", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequiredBlockUnsatisfied);

    let out = render(&env, "{% extends 'p' %}{% block must %}ok{% endblock %}");
    assert_eq!(out, "xoky");
}

#[test]
fn extends_cycle_is_detected() {
    let env = env_with(vec![
        ("a", "{% extends 'b' %}"),
        ("b", "{% extends 'a' %}"),
    ]);
    let err = env.render_template("a", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
}

#[test]
fn include_cycle_through_extends_is_detected() {
    let env = env_with(vec![
        ("a", "{% extends 'b' %}"),
        ("b", "{% include 'a' %}"),
    ]);
    let err = env.render_template("a", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
}

#[test]
fn include_renders_inline_with_context() {
    let env = env_with(vec![("part", "({{ name }})")]);
    let out = env
        .render_string(
            "a{% include 'part' %}b",
            "t",
            [("name".to_owned(), Object::from("x"))].into_iter().collect(),
        )
        .unwrap();
    assert_eq!(out, "a(x)b");
}

#[test]
fn include_without_context_hides_variables() {
    let env = env_with(vec![("part", "({{ name }})")]);
    let out = env
        .render_string(
            "{% include 'part' without context %}",
            "t",
            [("name".to_owned(), Object::from("x"))].into_iter().collect(),
        )
        .unwrap();
    assert_eq!(out, "()");
}

#[test]
fn include_set_does_not_leak_back() {
    let env = env_with(vec![("part", "{% set leaked = 1 %}")]);
    let out = env
        .render_string("{% include 'part' %}{{ leaked | default('clean') }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "clean");
}

#[test]
fn include_list_tries_names_in_order() {
    let env = env_with(vec![("second", "2nd")]);
    let out = env
        .render_string("{% include ['first', 'second'] %}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "2nd");
}

#[test]
fn include_ignore_missing_renders_nothing() {
    let env = env_with(vec![]);
    let out = env
        .render_string("a{% include 'gone' ignore missing %}b", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "ab");

    let err = env
        .render_string("{% include 'gone' %}", "t", IndexMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
}

#[test]
fn included_template_may_extend() {
    let env = env_with(vec![
        ("base", "[{% block b %}base{% endblock %}]"),
        ("leaf", "{% extends 'base' %}{% block b %}leaf{% endblock %}"),
    ]);
    let out = env
        .render_string("pre {% include 'leaf' %} post", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "pre [leaf] post");
}

#[test]
fn child_top_level_output_is_suppressed() {
    let env = env_with(vec![("p", "P{% block b %}{% endblock %}")]);
    let out = render(&env, "{% extends 'p' %}ignored{% block b %}!{% endblock %}ignored");
    assert_eq!(out, "P!");
}
