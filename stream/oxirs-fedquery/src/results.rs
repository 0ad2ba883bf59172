//! # SPARQL results decoding
//!
//! Turns a remote response body into a [`BindingSet`]. SPARQL Results XML is
//! the preferred format; SPARQL Results JSON is accepted when the endpoint
//! answers with a JSON content type. ASK documents decode to an empty set.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use std::collections::HashMap;

use crate::algebra::{Binding, BindingSet, Iri, Literal, Term};
use crate::error::{FederationError, Result};

/// Wire format of a results payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsFormat {
    Xml,
    Json,
}

impl ResultsFormat {
    /// Pick a format from a response content type, defaulting to XML
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.contains("json") => ResultsFormat::Json,
            _ => ResultsFormat::Xml,
        }
    }
}

/// Decode a payload returned by `endpoint`
pub fn parse_results(endpoint: &str, body: &str, format: ResultsFormat) -> Result<BindingSet> {
    let parsed = match format {
        ResultsFormat::Xml => parse_xml_results(body),
        ResultsFormat::Json => parse_json_results(body),
    };
    parsed.map_err(|reason| FederationError::parse(endpoint, reason))
}

enum TermKind {
    Uri,
    Bnode,
    Literal {
        datatype: Option<String>,
        language: Option<String>,
    },
}

impl TermKind {
    fn from_element(e: &BytesStart<'_>) -> std::result::Result<Option<Self>, String> {
        let kind = match e.local_name().as_ref() {
            b"uri" => TermKind::Uri,
            b"bnode" => TermKind::Bnode,
            b"literal" => {
                let mut datatype = None;
                let mut language = None;
                for attr in e.attributes().flatten() {
                    let value = attr
                        .unescape_value()
                        .map_err(|err| err.to_string())?
                        .into_owned();
                    match attr.key.as_ref() {
                        b"datatype" => datatype = Some(value),
                        b"xml:lang" | b"lang" => language = Some(value),
                        _ => {}
                    }
                }
                TermKind::Literal { datatype, language }
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn into_term(self, text: &str) -> Term {
        match self {
            TermKind::Uri => Term::Iri(Iri::new(text)),
            TermKind::Bnode => Term::BlankNode(text.to_string()),
            TermKind::Literal { datatype, language } => Term::Literal(Literal {
                value: text.to_string(),
                language,
                datatype: datatype.map(Iri::new),
            }),
        }
    }
}

fn binding_name(e: &BytesStart<'_>) -> std::result::Result<Option<String>, String> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"name" {
            let name = attr.unescape_value().map_err(|err| err.to_string())?;
            return Ok(Some(name.into_owned()));
        }
    }
    Ok(None)
}

/// Parse SPARQL Results XML
pub fn parse_xml_results(xml: &str) -> std::result::Result<BindingSet, String> {
    let mut reader = Reader::from_str(xml);

    let mut solutions = BindingSet::new();
    let mut current_solution: Option<Binding> = None;
    let mut current_name: Option<String> = None;
    let mut current_term: Option<TermKind> = None;
    let mut text_buf = String::new();
    let mut seen_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"sparql" => seen_root = true,
                b"result" => current_solution = Some(Binding::new()),
                b"binding" => current_name = binding_name(e)?,
                _ => {
                    if let Some(kind) = TermKind::from_element(e)? {
                        current_term = Some(kind);
                        text_buf.clear();
                    }
                }
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"sparql" => seen_root = true,
                b"result" => solutions.push(Binding::new()),
                _ => {
                    // <literal/> is an empty string value
                    if let (Some(kind), Some(name), Some(solution)) = (
                        TermKind::from_element(e)?,
                        current_name.as_ref(),
                        current_solution.as_mut(),
                    ) {
                        solution.insert(name.clone(), kind.into_term(""));
                    }
                }
            },
            Ok(Event::Text(e)) => {
                if current_term.is_some() {
                    let text = e.unescape().map_err(|err| err.to_string())?;
                    text_buf.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if current_term.is_some() {
                    text_buf.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"result" => {
                    if let Some(solution) = current_solution.take() {
                        solutions.push(solution);
                    }
                }
                b"binding" => current_name = None,
                b"uri" | b"bnode" | b"literal" => {
                    if let (Some(kind), Some(name), Some(solution)) = (
                        current_term.take(),
                        current_name.as_ref(),
                        current_solution.as_mut(),
                    ) {
                        solution.insert(name.clone(), kind.into_term(&text_buf));
                    }
                    text_buf.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(format!(
                    "XML error at position {}: {}",
                    reader.error_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    if !seen_root {
        return Err("missing <sparql> root element".to_string());
    }
    Ok(solutions)
}

#[derive(Deserialize)]
struct JsonResults {
    #[serde(default)]
    results: Option<JsonBindings>,
    #[serde(default)]
    boolean: Option<bool>,
}

#[derive(Deserialize)]
struct JsonBindings {
    bindings: Vec<HashMap<String, JsonTerm>>,
}

#[derive(Deserialize)]
struct JsonTerm {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(rename = "xml:lang", default)]
    language: Option<String>,
    #[serde(default)]
    datatype: Option<String>,
}

impl JsonTerm {
    fn into_term(self) -> std::result::Result<Term, String> {
        match self.kind.as_str() {
            "uri" => Ok(Term::Iri(Iri::new(self.value))),
            "bnode" => Ok(Term::BlankNode(self.value)),
            "literal" | "typed-literal" => Ok(Term::Literal(Literal {
                value: self.value,
                language: self.language,
                datatype: self.datatype.map(Iri::new),
            })),
            other => Err(format!("unknown term type '{}'", other)),
        }
    }
}

/// Parse SPARQL Results JSON
pub fn parse_json_results(json: &str) -> std::result::Result<BindingSet, String> {
    let doc: JsonResults = serde_json::from_str(json).map_err(|e| e.to_string())?;
    match (doc.results, doc.boolean) {
        (Some(results), _) => results
            .bindings
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(name, term)| term.into_term().map(|t| (name, t)))
                    .collect::<std::result::Result<Binding, String>>()
            })
            .collect(),
        (None, Some(_)) => Ok(BindingSet::new()),
        (None, None) => Err("neither results nor boolean in JSON document".to_string()),
    }
}
