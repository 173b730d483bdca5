use anytemplate_tal::{TalError, TalOptions, TalTemplate};
use serde_json::{json, Map, Value};

fn data(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn test_xhtml_page() {
    let source = r##"<html xmlns="http://www.w3.org/1999/xhtml" xmlns:tal="http://xml.zope.org/namespaces/tal">
<head><title tal:content="title">Title</title></head>
<body>
<h1 tal:condition="heading" tal:content="heading">Heading</h1>
<p class="note" tal:attributes="class css">Body <a href="#" tal:attributes="href link" tal:content="label">link</a></p>
<div tal:replace="structure footer">footer</div>
</body>
</html>"##;

    let template = TalTemplate::parse(source).unwrap();
    let output = template
        .render(&data(json!({
            "title": "Welcome",
            "heading": "",
            "css": "lead",
            "link": "/about",
            "label": "About <us>",
            "footer": "<footer>bye</footer>",
        })))
        .unwrap();

    assert!(output.contains("<title>Welcome</title>"));
    assert!(!output.contains("<h1"));
    assert!(output.contains(r#"<p class="lead">"#));
    assert!(output.contains(r#"<a href="/about">About &lt;us&gt;</a>"#));
    assert!(output.contains("<footer>bye</footer>"));
    assert!(!output.contains("tal:"));
}

#[test]
fn test_same_template_renders_twice() {
    let template = TalTemplate::parse(r#"<b tal:content="n">0</b>"#).unwrap();
    assert_eq!(template.render(&data(json!({"n": 1}))).unwrap(), "<b>1</b>");
    assert_eq!(template.render(&data(json!({"n": 2}))).unwrap(), "<b>2</b>");
}

#[test]
fn test_strict_mode_reports_path() {
    let template = TalTemplate::parse_with(
        r#"<i tal:replace="a.b.c"/>"#,
        TalOptions { strict: true },
    )
    .unwrap();
    match template.render(&data(json!({"a": {"b": {}}}))) {
        Err(TalError::Undefined(path)) => assert_eq!(path, "a.b.c"),
        other => panic!("expected undefined path error, got {:?}", other),
    }
}

#[test]
fn test_content_on_empty_element_expands_it() {
    let template = TalTemplate::parse(r#"<td tal:content="v"/>"#).unwrap();
    assert_eq!(
        template.render(&data(json!({"v": "x"}))).unwrap(),
        "<td>x</td>"
    );
}
