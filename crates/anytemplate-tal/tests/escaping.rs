use anytemplate_tal::TalTemplate;
use proptest::prelude::*;
use serde_json::{Map, Value};

proptest! {
    #[test]
    fn test_content_never_injects_markup(text in "[ -~]{0,40}") {
        let template = TalTemplate::parse(r#"<p tal:content="v">x</p>"#).unwrap();
        let mut data = Map::new();
        data.insert("v".to_string(), Value::String(text.clone()));
        let output = template.render(&data).unwrap();

        let inner = &output["<p>".len()..output.len() - "</p>".len()];
        prop_assert!(!inner.contains('<'));
        prop_assert!(!inner.contains('>'));
        let stripped = ["&lt;", "&gt;", "&amp;", "&quot;", "&apos;"]
            .iter()
            .fold(inner.to_string(), |acc, entity| acc.replace(entity, ""));
        prop_assert!(!stripped.contains('&'));
    }

    #[test]
    fn test_structure_inserts_verbatim(text in "[a-z<>/ ]{0,40}") {
        let template = TalTemplate::parse(r#"<div tal:replace="structure v">x</div>"#).unwrap();
        let mut data = Map::new();
        data.insert("v".to_string(), Value::String(text.clone()));
        prop_assert_eq!(template.render(&data).unwrap(), text);
    }
}
