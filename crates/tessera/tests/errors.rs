//! The error surface: categories, source positions, and the strict undefined
//! policy.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tessera::{DictLoader, Environment, ErrorKind, Object, UndefinedPolicy};

fn render_err(source: &str) -> tessera::Error {
    Environment::new()
        .render_string(source, "test", IndexMap::new())
        .unwrap_err()
}

#[test]
fn unterminated_string_is_a_lex_error() {
    let err = render_err("{{ 'open }}");
    assert_eq!(err.kind(), ErrorKind::UnterminatedString);
    assert_eq!(err.template(), Some("test"));
}

#[test]
fn unterminated_comment_is_a_lex_error() {
    assert_eq!(render_err("{# open").kind(), ErrorKind::UnterminatedComment);
}

#[test]
fn unterminated_raw_is_a_lex_error() {
    assert_eq!(render_err("{% raw %}x").kind(), ErrorKind::UnterminatedRawBlock);
}

#[test]
fn unexpected_character_is_a_lex_error() {
    assert_eq!(render_err("{{ a ? b }}").kind(), ErrorKind::UnexpectedCharacter);
}

#[test]
fn missing_expression_is_a_parse_error() {
    assert_eq!(render_err("{% if %}x{% endif %}").kind(), ErrorKind::UnexpectedToken);
}

#[test]
fn missing_terminator_is_a_parse_error() {
    assert_eq!(render_err("{% for x in xs %}y").kind(), ErrorKind::UnterminatedBlock);
}

#[test]
fn second_extends_is_rejected() {
    assert_eq!(render_err("{% extends 'a' %}{% extends 'b' %}").kind(), ErrorKind::MultipleExtends);
}

#[test]
fn assignment_to_literal_is_rejected() {
    assert_eq!(render_err("{% set 1 = 2 %}").kind(), ErrorKind::InvalidAssignmentTarget);
}

#[test]
fn break_outside_loop_is_a_compile_error() {
    assert_eq!(render_err("{% break %}").kind(), ErrorKind::OutsideLoop);
}

#[test]
fn errors_carry_line_and_column() {
    let err = render_err("line one\n{{ 1 / 0 }}");
    assert_eq!(err.kind(), ErrorKind::DivisionByZero);
    assert_eq!(err.line(), Some(2));
    assert!(err.column().is_some());
}

#[test]
fn division_and_modulo_by_zero() {
    assert_eq!(render_err("{{ 1 / 0 }}").kind(), ErrorKind::DivisionByZero);
    assert_eq!(render_err("{{ 1 % 0 }}").kind(), ErrorKind::DivisionByZero);
    assert_eq!(render_err("{{ 1 // 0 }}").kind(), ErrorKind::DivisionByZero);
}

#[test]
fn type_mismatch_is_invalid_operation() {
    assert_eq!(render_err("{{ 'a' + 1 }}").kind(), ErrorKind::InvalidOperation);
    assert_eq!(render_err("{{ 1 | first }}").kind(), ErrorKind::InvalidOperation);
    assert_eq!(render_err("{{ 3() }}").kind(), ErrorKind::InvalidOperation);
}

#[test]
fn integer_overflow_is_reported() {
    assert_eq!(render_err("{{ 9223372036854775807 + 1 }}").kind(), ErrorKind::IntegerOverflow);
}

#[test]
fn unknown_filter_and_test() {
    assert_eq!(render_err("{{ 1 | nosuch }}").kind(), ErrorKind::UnknownFilter);
    assert_eq!(render_err("{{ 1 is nosuch }}").kind(), ErrorKind::UnknownTest);
}

#[test]
fn filter_arity_mismatch() {
    assert_eq!(render_err("{{ 'a' | upper(1) }}").kind(), ErrorKind::InvalidArguments);
    assert_eq!(render_err("{{ 'a' | replace('x') }}").kind(), ErrorKind::InvalidArguments);
}

#[test]
fn raise_exception_from_template() {
    let err = render_err("{{ raise_exception('broken input') }}");
    assert_eq!(err.kind(), ErrorKind::RaisedException);
    assert_eq!(err.message(), "broken input");
}

#[test]
fn template_not_found_without_loader() {
    let env = Environment::new();
    let err = env.render_template("gone", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
}

#[test]
fn lenient_undefined_renders_empty() {
    let env = Environment::new();
    let out = env.render_string("[{{ missing }}]", "t", IndexMap::new()).unwrap();
    assert_eq!(out, "[]");
}

#[test]
fn strict_undefined_elevates_rendering() {
    let mut env = Environment::new();
    env.set_undefined_policy(UndefinedPolicy::Strict);
    let err = env.render_string("{{ missing }}", "t", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
}

#[test]
fn strict_undefined_elevates_iteration_and_attributes() {
    let mut env = Environment::new();
    env.set_undefined_policy(UndefinedPolicy::Strict);
    let err = env
        .render_string("{% for x in missing %}{% endfor %}", "t", IndexMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
    let err = env.render_string("{{ missing.attr }}", "t", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
}

#[test]
fn strict_undefined_still_allows_defined_test_and_default() {
    let mut env = Environment::new();
    env.set_undefined_policy(UndefinedPolicy::Strict);
    let out = env
        .render_string("{{ 'y' if missing is not defined }}{{ missing | default('d') }}", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "yd");
}

#[test]
fn chainable_policy_chains_lookups() {
    let mut env = Environment::new();
    env.set_undefined_policy(UndefinedPolicy::Chainable);
    let out = env
        .render_string("[{{ missing.a.b[0] }}]", "t", IndexMap::new())
        .unwrap();
    assert_eq!(out, "[]");
}

#[test]
fn arithmetic_on_undefined_fails_even_lenient() {
    assert_eq!(render_err("{{ missing + 1 }}").kind(), ErrorKind::InvalidOperation);
}

#[test]
fn async_entry_without_enable_async() {
    let env = Environment::new();
    let err = env.render_string_async("x", "t", IndexMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AsyncNotEnabled);
}

#[test]
fn partial_output_is_discarded_on_error() {
    let env = Environment::new();
    let result = env.render_string("before {{ 1 / 0 }} after", "t", IndexMap::new());
    assert!(result.is_err());
}

#[test]
fn errors_name_the_failing_template_in_a_chain() {
    let mut env = Environment::new();
    env.set_loader([("inner", "{{ 1 / 0 }}")].into_iter().collect::<DictLoader>());
    let err = env
        .render_string("{% include 'inner' %}", "outer", IndexMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DivisionByZero);
    assert_eq!(err.template(), Some("inner"));
}

#[test]
fn user_raised_condition_in_realistic_template() {
    let source = "{% if messages | length == 0 %}{{ raise_exception('conversation is empty') }}{% endif %}ok";
    let env = Environment::new();
    let vars: IndexMap<String, Object> = [("messages".to_owned(), Object::List(vec![]))].into_iter().collect();
    let err = env.render_string(source, "t", vars.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RaisedException);

    let vars: IndexMap<String, Object> =
        [("messages".to_owned(), Object::List(vec![Object::from("hi")]))].into_iter().collect();
    assert_eq!(env.render_string(source, "t", vars).unwrap(), "ok");
}
