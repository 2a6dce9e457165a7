//! Rendering model chat templates: the same template sources that ship with
//! chat models, evaluated against message lists.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tessera::{Environment, Object};

fn msg(role: &str, content: &str) -> Object {
    let mut m = IndexMap::new();
    m.insert("role".to_owned(), Object::from(role));
    m.insert("content".to_owned(), Object::from(content));
    Object::Map(m)
}

fn render(source: &str, vars: Vec<(&str, Object)>) -> String {
    let env = Environment::new();
    env.render_string(source, "chat", vars.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
        .unwrap()
}

#[test]
fn chatml_template() {
    let source = "{% for message in messages %}{{'<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n'}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}";
    let vars = vec![
        (
            "messages",
            Object::List(vec![msg("system", "You are helpful."), msg("user", "Hi")]),
        ),
        ("add_generation_prompt", Object::Bool(true)),
    ];
    assert_eq!(
        render(source, vars),
        "<|im_start|>system\nYou are helpful.<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
    );
}

#[test]
fn llama_style_template_with_trims() {
    let source = "\
{%- for message in messages -%}
{%- if message['role'] == 'user' -%}
{{- bos_token + '[INST] ' + message['content'].strip() + ' [/INST]' -}}
{%- elif message['role'] == 'assistant' -%}
{{- ' ' + message['content'].strip() + ' ' + eos_token -}}
{%- endif -%}
{%- endfor -%}";
    let vars = vec![
        ("bos_token", Object::from("<s>")),
        ("eos_token", Object::from("</s>")),
        (
            "messages",
            Object::List(vec![msg("user", "Hello"), msg("assistant", "  Hi there  ")]),
        ),
    ];
    assert_eq!(render(source, vars), "<s>[INST] Hello [/INST] Hi there </s>");
}

#[test]
fn system_message_extraction_with_slicing() {
    let source = "{% if messages[0]['role'] == 'system' %}{% set system_message = messages[0]['content'] %}{% set loop_messages = messages[1:] %}{% else %}{% set system_message = '' %}{% set loop_messages = messages %}{% endif %}{{ system_message }}{% for message in loop_messages %}[{{ message['role'] }}]{{ message['content'] }}{% endfor %}";
    let vars = vec![(
        "messages",
        Object::List(vec![msg("system", "S!"), msg("user", "hi"), msg("assistant", "yo")]),
    )];
    assert_eq!(render(source, vars), "S![user]hi[assistant]yo");

    let vars = vec![("messages", Object::List(vec![msg("user", "solo")]))];
    assert_eq!(render(source, vars), "[user]solo");
}

#[test]
fn role_alternation_check_with_raise_exception() {
    let source = "{% for message in messages %}{% if loop.index0 % 2 == 0 and message['role'] != 'user' %}{{ raise_exception('roles must alternate user/assistant') }}{% endif %}{{ message['content'] }};{% endfor %}";
    let ok = vec![(
        "messages",
        Object::List(vec![msg("user", "a"), msg("assistant", "b")]),
    )];
    assert_eq!(render(source, ok), "a;b;");

    let bad = vec![(
        "messages",
        Object::List(vec![msg("assistant", "a")]),
    )];
    let env = Environment::new();
    let err = env
        .render_string(source, "chat", bad.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
        .unwrap_err();
    assert_eq!(err.kind(), tessera::ErrorKind::RaisedException);
}

#[test]
fn generation_prompt_only_after_last_message() {
    let source = "{% for m in messages %}{{ m['role'] }}: {{ m['content'] }}{% if not loop.last %}\n{% endif %}{% endfor %}{% if add_generation_prompt %}\nassistant:{% endif %}";
    let vars = vec![
        (
            "messages",
            Object::List(vec![msg("user", "q1"), msg("assistant", "a1"), msg("user", "q2")]),
        ),
        ("add_generation_prompt", Object::Bool(true)),
    ];
    assert_eq!(render(source, vars), "user: q1\nassistant: a1\nuser: q2\nassistant:");
}

#[test]
fn default_filter_covers_missing_flags() {
    // templates routinely guard optional flags with `default`
    let source = "{{ 'gen' if add_generation_prompt | default(false) else 'nogen' }}";
    assert_eq!(render(source, vec![]), "nogen");
    assert_eq!(
        render(source, vec![("add_generation_prompt", Object::Bool(true))]),
        "gen"
    );
}
