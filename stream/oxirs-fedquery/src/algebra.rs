//! Query tree for federated planning
//!
//! A syntax-level representation of SPARQL SELECT queries: group patterns keep
//! their element order so that the rewriter can relocate filters and binds and
//! so that the serialized text sent to remote endpoints mirrors the original
//! query layout. Every node kind is a variant of [`GraphPattern`] and planners
//! dispatch on it with an exhaustive `match`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Variable identifier (without the leading `?`)
pub type Variable = String;

/// IRI (Internationalized Resource Identifier)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Iri(pub String);

impl Iri {
    pub fn new(value: impl Into<String>) -> Self {
        Iri(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";

/// Literal value with optional language tag or datatype
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    pub value: String,
    pub language: Option<String>,
    pub datatype: Option<Iri>,
}

impl Literal {
    pub fn simple(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            language: None,
            datatype: None,
        }
    }

    pub fn typed(value: impl Into<String>, datatype: Iri) -> Self {
        Self {
            value: value.into(),
            language: None,
            datatype: Some(datatype),
        }
    }

    pub fn lang(value: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            language: Some(language.into()),
            datatype: None,
        }
    }

    pub fn integer(value: i64) -> Self {
        Self::typed(value.to_string(), Iri::new(XSD_INTEGER))
    }

    /// Interpret the literal as an xsd:boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self.value.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.value.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                '\t' => f.write_str("\\t")?,
                c => write!(f, "{}", c)?,
            }
        }
        f.write_str("\"")?;
        if let Some(lang) = &self.language {
            write!(f, "@{}", lang)?;
        } else if let Some(dt) = &self.datatype {
            write!(f, "^^{}", dt)?;
        }
        Ok(())
    }
}

/// RDF term (subject, predicate, or object)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Variable(Variable),
    Iri(Iri),
    Literal(Literal),
    BlankNode(String),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }

    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(Iri::new(value))
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal(Literal::simple(value))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Term::BlankNode(_))
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Term::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_iri(&self) -> Option<&Iri> {
        match self {
            Term::Iri(iri) => Some(iri),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(v) => write!(f, "?{}", v),
            Term::Iri(iri) => write!(f, "{}", iri),
            Term::Literal(lit) => write!(f, "{}", lit),
            Term::BlankNode(id) => write!(f, "_:{}", id),
        }
    }
}

/// Triple pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl TriplePattern {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// Property path expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyPath {
    Predicate(Iri),
    Inverse(Box<PropertyPath>),
    Sequence(Vec<PropertyPath>),
    Alternative(Vec<PropertyPath>),
    ZeroOrMore(Box<PropertyPath>),
    OneOrMore(Box<PropertyPath>),
    ZeroOrOne(Box<PropertyPath>),
    NegatedPropertySet(Vec<Iri>),
}

impl PropertyPath {
    /// Predicates mentioned by the path, in first-occurrence order
    pub fn predicates(&self) -> Vec<&Iri> {
        let mut out = Vec::new();
        self.collect_predicates(&mut out);
        out
    }

    fn collect_predicates<'a>(&'a self, out: &mut Vec<&'a Iri>) {
        match self {
            PropertyPath::Predicate(iri) => {
                if !out.contains(&iri) {
                    out.push(iri);
                }
            }
            PropertyPath::Inverse(p)
            | PropertyPath::ZeroOrMore(p)
            | PropertyPath::OneOrMore(p)
            | PropertyPath::ZeroOrOne(p) => p.collect_predicates(out),
            PropertyPath::Sequence(ps) | PropertyPath::Alternative(ps) => {
                for p in ps {
                    p.collect_predicates(out);
                }
            }
            PropertyPath::NegatedPropertySet(iris) => {
                for iri in iris {
                    if !out.contains(&iri) {
                        out.push(iri);
                    }
                }
            }
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyPath::Predicate(iri) => write!(f, "{}", iri),
            PropertyPath::Inverse(p) => write!(f, "^({})", p),
            PropertyPath::Sequence(ps) => write_joined(f, ps, "/"),
            PropertyPath::Alternative(ps) => write_joined(f, ps, "|"),
            PropertyPath::ZeroOrMore(p) => write!(f, "({})*", p),
            PropertyPath::OneOrMore(p) => write!(f, "({})+", p),
            PropertyPath::ZeroOrOne(p) => write!(f, "({})?", p),
            PropertyPath::NegatedPropertySet(iris) => {
                f.write_str("!(")?;
                for (i, iri) in iris.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{}", iri)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, paths: &[PropertyPath], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, p) in paths.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", p)?;
    }
    f.write_str(")")
}

/// Property path pattern: `subject path object`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathPattern {
    pub subject: Term,
    pub path: PropertyPath,
    pub object: Term,
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.path, self.object)
    }
}

/// A single triple or property-path pattern: the atomic unit of federation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fragment {
    Triple(TriplePattern),
    Path(PathPattern),
}

impl Fragment {
    pub fn triple(subject: Term, predicate: Term, object: Term) -> Self {
        Fragment::Triple(TriplePattern::new(subject, predicate, object))
    }

    pub fn path(subject: Term, path: PropertyPath, object: Term) -> Self {
        Fragment::Path(PathPattern {
            subject,
            path,
            object,
        })
    }

    pub fn is_path(&self) -> bool {
        matches!(self, Fragment::Path(_))
    }

    pub fn subject(&self) -> &Term {
        match self {
            Fragment::Triple(t) => &t.subject,
            Fragment::Path(p) => &p.subject,
        }
    }

    pub fn object(&self) -> &Term {
        match self {
            Fragment::Triple(t) => &t.object,
            Fragment::Path(p) => &p.object,
        }
    }

    /// Free variables bound by the fragment
    pub fn variables(&self) -> BTreeSet<Variable> {
        let mut vars = BTreeSet::new();
        let terms: Vec<&Term> = match self {
            Fragment::Triple(t) => vec![&t.subject, &t.predicate, &t.object],
            Fragment::Path(p) => vec![&p.subject, &p.object],
        };
        for term in terms {
            if let Term::Variable(v) = term {
                vars.insert(v.clone());
            }
        }
        vars
    }

    /// True when both fragments bind at least one common variable
    pub fn shares_variable(&self, other: &Fragment) -> bool {
        let mine = self.variables();
        other.variables().iter().any(|v| mine.contains(v))
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Triple(t) => write!(f, "{}", t),
            Fragment::Path(p) => write!(f, "{}", p),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOperator {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::And => "&&",
            BinaryOperator::Or => "||",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::Less => "<",
            BinaryOperator::LessEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterEqual => ">=",
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Plus,
    Minus,
    IsIri,
    IsBlank,
    IsLiteral,
    IsNumeric,
}

/// SPARQL expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Variable(Variable),
    Literal(Literal),
    Iri(Iri),
    Function {
        name: String,
        args: Vec<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    Bound(Variable),
    Exists(Box<GraphPattern>),
    NotExists(Box<GraphPattern>),
}

impl Expression {
    pub fn var(name: impl Into<String>) -> Self {
        Expression::Variable(name.into())
    }

    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, expr: Expression) -> Self {
        Expression::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    /// Equality test between a variable and a constant term
    pub fn equal_term(var: &str, term: &Term) -> Self {
        let value = match term {
            Term::Iri(iri) => Expression::Iri(iri.clone()),
            Term::Literal(lit) => Expression::Literal(lit.clone()),
            Term::Variable(v) => Expression::Variable(v.clone()),
            Term::BlankNode(id) => Expression::Literal(Literal::simple(id.clone())),
        };
        Expression::binary(BinaryOperator::Equal, Expression::var(var), value)
    }

    /// Fold a list into a left-deep chain of `op`
    pub fn fold(op: BinaryOperator, exprs: Vec<Expression>) -> Option<Expression> {
        exprs.into_iter().reduce(|acc, e| Expression::binary(op, acc, e))
    }

    /// Variables referenced by the expression, including inside EXISTS patterns
    pub fn free_variables(&self) -> BTreeSet<Variable> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, vars: &mut BTreeSet<Variable>) {
        match self {
            Expression::Variable(v) | Expression::Bound(v) => {
                vars.insert(v.clone());
            }
            Expression::Literal(_) | Expression::Iri(_) => {}
            Expression::Function { args, .. } => {
                for arg in args {
                    arg.collect_variables(vars);
                }
            }
            Expression::Binary { left, right, .. } => {
                left.collect_variables(vars);
                right.collect_variables(vars);
            }
            Expression::Unary { expr, .. } => expr.collect_variables(vars),
            Expression::Exists(p) | Expression::NotExists(p) => {
                vars.extend(p.variables());
            }
        }
    }

    /// True if an EXISTS / NOT EXISTS occurs anywhere in the expression
    pub fn contains_exists(&self) -> bool {
        match self {
            Expression::Exists(_) | Expression::NotExists(_) => true,
            Expression::Function { args, .. } => args.iter().any(|a| a.contains_exists()),
            Expression::Binary { left, right, .. } => {
                left.contains_exists() || right.contains_exists()
            }
            Expression::Unary { expr, .. } => expr.contains_exists(),
            _ => false,
        }
    }

    /// Mutable access to every EXISTS pattern in the expression
    pub fn exists_patterns_mut(&mut self) -> Vec<&mut GraphPattern> {
        let mut out = Vec::new();
        self.collect_exists_mut(&mut out);
        out
    }

    fn collect_exists_mut<'a>(&'a mut self, out: &mut Vec<&'a mut GraphPattern>) {
        match self {
            Expression::Exists(p) | Expression::NotExists(p) => out.push(p.as_mut()),
            Expression::Function { args, .. } => {
                for arg in args {
                    arg.collect_exists_mut(out);
                }
            }
            Expression::Binary { left, right, .. } => {
                left.collect_exists_mut(out);
                right.collect_exists_mut(out);
            }
            Expression::Unary { expr, .. } => expr.collect_exists_mut(out),
            _ => {}
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Variable(v) => write!(f, "?{}", v),
            Expression::Literal(l) => write!(f, "{}", l),
            Expression::Iri(i) => write!(f, "{}", i),
            Expression::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expression::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expression::Unary { op, expr } => match op {
                UnaryOperator::Not => write!(f, "!({})", expr),
                UnaryOperator::Plus => write!(f, "+({})", expr),
                UnaryOperator::Minus => write!(f, "-({})", expr),
                UnaryOperator::IsIri => write!(f, "isIRI({})", expr),
                UnaryOperator::IsBlank => write!(f, "isBlank({})", expr),
                UnaryOperator::IsLiteral => write!(f, "isLiteral({})", expr),
                UnaryOperator::IsNumeric => write!(f, "isNumeric({})", expr),
            },
            Expression::Bound(v) => write!(f, "bound(?{})", v),
            Expression::Exists(p) => write!(f, "EXISTS {}", Braced(p)),
            Expression::NotExists(p) => write!(f, "NOT EXISTS {}", Braced(p)),
        }
    }
}

/// Aggregate function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    Count {
        distinct: bool,
        expr: Option<Expression>,
    },
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Count { distinct, expr } => {
                f.write_str("COUNT(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                match expr {
                    Some(e) => write!(f, "{}", e)?,
                    None => f.write_str("*")?,
                }
                f.write_str(")")
            }
        }
    }
}

/// Order condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCondition {
    pub expr: Expression,
    pub ascending: bool,
}

/// Inline data table (`VALUES`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValuesTable {
    pub variables: Vec<Variable>,
    pub rows: Vec<Vec<Option<Term>>>,
}

impl ValuesTable {
    pub fn new(variables: Vec<Variable>) -> Self {
        Self {
            variables,
            rows: Vec::new(),
        }
    }

    /// Single-variable table, one row per value
    pub fn single(variable: Variable, values: Vec<Term>) -> Self {
        Self {
            variables: vec![variable],
            rows: values.into_iter().map(|v| vec![Some(v)]).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() || self.rows.is_empty()
    }
}

impl fmt::Display for ValuesTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VALUES (")?;
        for (i, v) in self.variables.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "?{}", v)?;
        }
        f.write_str(") {")?;
        for row in &self.rows {
            f.write_str(" (")?;
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                match cell {
                    Some(term) => write!(f, "{}", term)?,
                    None => f.write_str("UNDEF")?,
                }
            }
            f.write_str(")")?;
        }
        f.write_str(" }")
    }
}

/// Endpoint position of a SERVICE node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEndpoints {
    /// One or more endpoint identifiers (generalized service when several)
    Endpoints(Vec<Iri>),
    /// Endpoint named by a variable, resolved at run time
    Variable(Variable),
}

impl ServiceEndpoints {
    pub fn single(iri: Iri) -> Self {
        ServiceEndpoints::Endpoints(vec![iri])
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            ServiceEndpoints::Variable(v) => Some(v),
            ServiceEndpoints::Endpoints(_) => None,
        }
    }

    /// Set equality on the endpoint list; variables compare by name
    pub fn same_endpoints(&self, other: &ServiceEndpoints) -> bool {
        match (self, other) {
            (ServiceEndpoints::Endpoints(a), ServiceEndpoints::Endpoints(b)) => {
                a.len() == b.len()
                    && a.iter().all(|x| b.contains(x))
                    && b.iter().all(|x| a.contains(x))
            }
            (ServiceEndpoints::Variable(a), ServiceEndpoints::Variable(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceEndpoints::Endpoints(iris) => {
                for (i, iri) in iris.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", iri)?;
                }
                Ok(())
            }
            ServiceEndpoints::Variable(v) => write!(f, "?{}", v),
        }
    }
}

/// SERVICE node: endpoint list plus a self-contained body query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePattern {
    pub endpoints: ServiceEndpoints,
    pub body: Box<Query>,
    pub silent: bool,
}

impl ServicePattern {
    /// Service whose body is `SELECT * WHERE { elements }`
    pub fn new(endpoints: ServiceEndpoints, elements: Vec<GraphPattern>) -> Self {
        Self {
            endpoints,
            body: Box::new(Query::select_all(GraphPattern::Group(elements))),
            silent: false,
        }
    }

    /// Elements of the body's top-level group
    pub fn elements(&self) -> &[GraphPattern] {
        self.body.pattern.elements()
    }

    pub fn elements_mut(&mut self) -> &mut Vec<GraphPattern> {
        self.body.pattern.elements_mut()
    }

    /// Variables certainly bound by the body
    pub fn in_scope_variables(&self) -> BTreeSet<Variable> {
        self.body.projected_variables()
    }
}

impl fmt::Display for ServicePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SERVICE ")?;
        if self.silent {
            f.write_str("SILENT ")?;
        }
        write!(f, "{} ", self.endpoints)?;
        if self.body.is_plain() {
            write!(f, "{}", Braced(&self.body.pattern))
        } else {
            write!(f, "{{ {} }}", self.body)
        }
    }
}

/// Query tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphPattern {
    /// Basic pattern block: an ordered conjunction of elements
    Group(Vec<GraphPattern>),
    /// Single triple or property-path fragment
    Pattern(Fragment),
    Filter(Expression),
    Bind {
        expression: Expression,
        variable: Variable,
    },
    Optional {
        left: Box<GraphPattern>,
        right: Box<GraphPattern>,
    },
    Minus {
        left: Box<GraphPattern>,
        right: Box<GraphPattern>,
    },
    Union {
        left: Box<GraphPattern>,
        right: Box<GraphPattern>,
    },
    /// Named graph pattern
    Graph {
        name: Term,
        pattern: Box<GraphPattern>,
    },
    Values(ValuesTable),
    Service(ServicePattern),
    Subquery(Box<Query>),
}

impl GraphPattern {
    pub fn group(elements: Vec<GraphPattern>) -> Self {
        GraphPattern::Group(elements)
    }

    pub fn triple(subject: Term, predicate: Term, object: Term) -> Self {
        GraphPattern::Pattern(Fragment::triple(subject, predicate, object))
    }

    pub fn optional(left: GraphPattern, right: GraphPattern) -> Self {
        GraphPattern::Optional {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn minus(left: GraphPattern, right: GraphPattern) -> Self {
        GraphPattern::Minus {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn union(left: GraphPattern, right: GraphPattern) -> Self {
        GraphPattern::Union {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn graph(name: Term, pattern: GraphPattern) -> Self {
        GraphPattern::Graph {
            name,
            pattern: Box::new(pattern),
        }
    }

    pub fn service(service: ServicePattern) -> Self {
        GraphPattern::Service(service)
    }

    pub fn is_service(&self) -> bool {
        matches!(self, GraphPattern::Service(_))
    }

    pub fn as_service(&self) -> Option<&ServicePattern> {
        match self {
            GraphPattern::Service(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a group; any other node is viewed as a one-element group
    pub fn elements(&self) -> &[GraphPattern] {
        match self {
            GraphPattern::Group(elements) => elements,
            other => std::slice::from_ref(other),
        }
    }

    /// Mutable group elements, wrapping a non-group node into a group first
    pub fn elements_mut(&mut self) -> &mut Vec<GraphPattern> {
        if !matches!(self, GraphPattern::Group(_)) {
            let node = std::mem::replace(self, GraphPattern::Group(Vec::new()));
            *self = GraphPattern::Group(vec![node]);
        }
        match self {
            GraphPattern::Group(elements) => elements,
            _ => unreachable!("node was wrapped into a group above"),
        }
    }

    /// Every variable mentioned anywhere in the pattern
    pub fn variables(&self) -> BTreeSet<Variable> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, vars: &mut BTreeSet<Variable>) {
        match self {
            GraphPattern::Group(elements) => {
                for e in elements {
                    e.collect_variables(vars);
                }
            }
            GraphPattern::Pattern(fragment) => vars.extend(fragment.variables()),
            GraphPattern::Filter(expr) => vars.extend(expr.free_variables()),
            GraphPattern::Bind {
                expression,
                variable,
            } => {
                vars.extend(expression.free_variables());
                vars.insert(variable.clone());
            }
            GraphPattern::Optional { left, right }
            | GraphPattern::Minus { left, right }
            | GraphPattern::Union { left, right } => {
                left.collect_variables(vars);
                right.collect_variables(vars);
            }
            GraphPattern::Graph { name, pattern } => {
                if let Term::Variable(v) = name {
                    vars.insert(v.clone());
                }
                pattern.collect_variables(vars);
            }
            GraphPattern::Values(table) => vars.extend(table.variables.iter().cloned()),
            GraphPattern::Service(service) => {
                if let ServiceEndpoints::Variable(v) = &service.endpoints {
                    vars.insert(v.clone());
                }
                service.body.pattern.collect_variables(vars);
            }
            GraphPattern::Subquery(query) => vars.extend(query.projected_variables()),
        }
    }

    /// Variables certainly bound by every solution of the pattern
    pub fn in_scope_variables(&self) -> BTreeSet<Variable> {
        match self {
            GraphPattern::Group(elements) => elements
                .iter()
                .flat_map(|e| e.in_scope_variables())
                .collect(),
            GraphPattern::Pattern(fragment) => fragment.variables(),
            GraphPattern::Filter(_) => BTreeSet::new(),
            GraphPattern::Bind { variable, .. } => BTreeSet::from([variable.clone()]),
            GraphPattern::Optional { left, .. } | GraphPattern::Minus { left, .. } => {
                left.in_scope_variables()
            }
            GraphPattern::Union { left, right } => {
                let r = right.in_scope_variables();
                left.in_scope_variables()
                    .into_iter()
                    .filter(|v| r.contains(v))
                    .collect()
            }
            GraphPattern::Graph { name, pattern } => {
                let mut vars = pattern.in_scope_variables();
                if let Term::Variable(v) = name {
                    vars.insert(v.clone());
                }
                vars
            }
            GraphPattern::Values(table) => table.variables.iter().cloned().collect(),
            GraphPattern::Service(service) => {
                let mut vars = service.in_scope_variables();
                if let ServiceEndpoints::Variable(v) = &service.endpoints {
                    vars.insert(v.clone());
                }
                vars
            }
            GraphPattern::Subquery(query) => query.projected_variables(),
        }
    }

    /// All fragments of the tree, in document order, including those inside
    /// service bodies, subqueries and EXISTS filters
    pub fn fragments(&self) -> Vec<&Fragment> {
        let mut out = Vec::new();
        self.collect_fragments(&mut out);
        out
    }

    fn collect_fragments<'a>(&'a self, out: &mut Vec<&'a Fragment>) {
        match self {
            GraphPattern::Group(elements) => {
                for e in elements {
                    e.collect_fragments(out);
                }
            }
            GraphPattern::Pattern(fragment) => out.push(fragment),
            GraphPattern::Filter(expr) | GraphPattern::Bind { expression: expr, .. } => {
                collect_expression_fragments(expr, out)
            }
            GraphPattern::Optional { left, right }
            | GraphPattern::Minus { left, right }
            | GraphPattern::Union { left, right } => {
                left.collect_fragments(out);
                right.collect_fragments(out);
            }
            GraphPattern::Graph { pattern, .. } => pattern.collect_fragments(out),
            GraphPattern::Values(_) => {}
            GraphPattern::Service(service) => service.body.pattern.collect_fragments(out),
            GraphPattern::Subquery(query) => query.pattern.collect_fragments(out),
        }
    }

    /// Every service node of the tree, outermost first
    pub fn services(&self) -> Vec<&ServicePattern> {
        let mut out = Vec::new();
        self.collect_services(&mut out);
        out
    }

    fn collect_services<'a>(&'a self, out: &mut Vec<&'a ServicePattern>) {
        match self {
            GraphPattern::Group(elements) => {
                for e in elements {
                    e.collect_services(out);
                }
            }
            GraphPattern::Optional { left, right }
            | GraphPattern::Minus { left, right }
            | GraphPattern::Union { left, right } => {
                left.collect_services(out);
                right.collect_services(out);
            }
            GraphPattern::Graph { pattern, .. } => pattern.collect_services(out),
            GraphPattern::Service(service) => {
                out.push(service);
                service.body.pattern.collect_services(out);
            }
            GraphPattern::Subquery(query) => query.pattern.collect_services(out),
            GraphPattern::Filter(expr) | GraphPattern::Bind { expression: expr, .. } => {
                if let Expression::Exists(p) | Expression::NotExists(p) = expr {
                    p.collect_services(out);
                }
            }
            GraphPattern::Pattern(_) | GraphPattern::Values(_) => {}
        }
    }
}

fn collect_expression_fragments<'a>(expr: &'a Expression, out: &mut Vec<&'a Fragment>) {
    match expr {
        Expression::Exists(p) | Expression::NotExists(p) => p.collect_fragments(out),
        Expression::Function { args, .. } => {
            for arg in args {
                collect_expression_fragments(arg, out);
            }
        }
        Expression::Binary { left, right, .. } => {
            collect_expression_fragments(left, out);
            collect_expression_fragments(right, out);
        }
        Expression::Unary { expr, .. } => collect_expression_fragments(expr, out),
        _ => {}
    }
}

/// Renders a pattern inside braces, without doubling the braces of a group
struct Braced<'a>(&'a GraphPattern);

impl fmt::Display for Braced<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            GraphPattern::Group(_) => write!(f, "{}", self.0),
            other => write!(f, "{{ {} }}", other),
        }
    }
}

impl fmt::Display for GraphPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphPattern::Group(elements) => {
                f.write_str("{")?;
                for e in elements {
                    write!(f, " {}", e)?;
                }
                f.write_str(" }")
            }
            GraphPattern::Pattern(fragment) => write!(f, "{} .", fragment),
            GraphPattern::Filter(expr) => write!(f, "FILTER({})", expr),
            GraphPattern::Bind {
                expression,
                variable,
            } => write!(f, "BIND({} AS ?{})", expression, variable),
            GraphPattern::Optional { left, right } => {
                write!(f, "{{ {} OPTIONAL {} }}", Braced(left), Braced(right))
            }
            GraphPattern::Minus { left, right } => {
                write!(f, "{{ {} MINUS {} }}", Braced(left), Braced(right))
            }
            GraphPattern::Union { left, right } => {
                write!(f, "{} UNION {}", Braced(left), Braced(right))
            }
            GraphPattern::Graph { name, pattern } => {
                write!(f, "GRAPH {} {}", name, Braced(pattern))
            }
            GraphPattern::Values(table) => write!(f, "{}", table),
            GraphPattern::Service(service) => write!(f, "{}", service),
            GraphPattern::Subquery(query) => write!(f, "{{ {} }}", query),
        }
    }
}

/// Query annotations (`@name value ...`) read by the planner and executor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        self.add(name, values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn add(&mut self, name: &str, values: Vec<String>) {
        self.entries
            .entry(name.to_string())
            .or_default()
            .extend(values);
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.values(name).iter().any(|v| v == value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Query dataset (`FROM` / `FROM NAMED`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub default_graphs: Vec<Iri>,
    pub named_graphs: Vec<Iri>,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.default_graphs.is_empty() && self.named_graphs.is_empty()
    }
}

/// SELECT query (top level or nested)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// Projected variables; empty means `SELECT *`
    pub projection: Vec<Variable>,
    pub aggregates: Vec<(Variable, Aggregate)>,
    pub distinct: bool,
    pub dataset: Dataset,
    pub pattern: GraphPattern,
    pub group_by: Vec<Variable>,
    pub having: Vec<Expression>,
    pub order_by: Vec<OrderCondition>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Trailing query-level VALUES clause
    pub values: Option<ValuesTable>,
    pub metadata: Metadata,
}

impl Default for GraphPattern {
    fn default() -> Self {
        GraphPattern::Group(Vec::new())
    }
}

impl Query {
    /// `SELECT * WHERE pattern`
    pub fn select_all(pattern: GraphPattern) -> Self {
        let pattern = match pattern {
            GraphPattern::Group(_) => pattern,
            other => GraphPattern::Group(vec![other]),
        };
        Self {
            pattern,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// A bare `SELECT * WHERE { }` with nothing else that needs a sub-select
    pub fn is_plain(&self) -> bool {
        self.projection.is_empty()
            && self.aggregates.is_empty()
            && !self.distinct
            && self.dataset.is_empty()
            && self.group_by.is_empty()
            && self.having.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
            && self.values.is_none()
    }

    /// Variables visible to an enclosing pattern
    pub fn projected_variables(&self) -> BTreeSet<Variable> {
        if self.projection.is_empty() && self.aggregates.is_empty() {
            return self.pattern.in_scope_variables();
        }
        self.projection
            .iter()
            .cloned()
            .chain(self.aggregates.iter().map(|(v, _)| v.clone()))
            .collect()
    }

    /// True if the query body carries its own VALUES table
    pub fn has_values(&self) -> bool {
        self.values.is_some()
            || self
                .pattern
                .elements()
                .iter()
                .any(|e| matches!(e, GraphPattern::Values(_)))
    }

    /// Expressions outside the WHERE clause (HAVING, ORDER BY)
    pub fn modifier_expressions_mut(&mut self) -> Vec<&mut Expression> {
        self.having
            .iter_mut()
            .chain(self.order_by.iter_mut().map(|c| &mut c.expr))
            .collect()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        if self.projection.is_empty() && self.aggregates.is_empty() {
            f.write_str("*")?;
        } else {
            let mut first = true;
            for v in &self.projection {
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "?{}", v)?;
                first = false;
            }
            for (v, agg) in &self.aggregates {
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "({} AS ?{})", agg, v)?;
                first = false;
            }
        }
        for g in &self.dataset.default_graphs {
            write!(f, " FROM {}", g)?;
        }
        for g in &self.dataset.named_graphs {
            write!(f, " FROM NAMED {}", g)?;
        }
        write!(f, " WHERE {}", Braced(&self.pattern))?;
        if !self.group_by.is_empty() {
            f.write_str(" GROUP BY")?;
            for v in &self.group_by {
                write!(f, " ?{}", v)?;
            }
        }
        for h in &self.having {
            write!(f, " HAVING({})", h)?;
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY")?;
            for c in &self.order_by {
                if c.ascending {
                    write!(f, " ASC({})", c.expr)?;
                } else {
                    write!(f, " DESC({})", c.expr)?;
                }
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        if let Some(values) = &self.values {
            write!(f, " {}", values)?;
        }
        Ok(())
    }
}

/// Variable binding
pub type Binding = HashMap<Variable, Term>;

/// Ordered sequence of bindings flowing into or out of a service
pub type BindingSet = Vec<Binding>;

/// Ambient bound variables outside the current binding set
pub type Environment = Binding;

/// An absent binding set, or one holding a single all-unbound binding,
/// carries no constraint yet
pub fn is_unconstrained(bindings: Option<&[Binding]>) -> bool {
    match bindings {
        None => true,
        Some(set) => set.is_empty() || (set.len() == 1 && set[0].is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foaf(local: &str) -> Term {
        Term::iri(format!("http://xmlns.com/foaf/0.1/{}", local))
    }

    #[test]
    fn test_fragment_variables_and_sharing() {
        let a = Fragment::triple(Term::var("s"), foaf("name"), Term::var("n"));
        let b = Fragment::triple(Term::var("s"), foaf("mbox"), Term::var("m"));
        let c = Fragment::triple(Term::var("x"), foaf("knows"), Term::var("y"));

        assert_eq!(a.variables(), BTreeSet::from(["n".to_string(), "s".to_string()]));
        assert!(a.shares_variable(&b));
        assert!(!a.shares_variable(&c));
    }

    #[test]
    fn test_path_predicates_are_deduplicated() {
        let knows = Iri::new("http://xmlns.com/foaf/0.1/knows");
        let name = Iri::new("http://xmlns.com/foaf/0.1/name");
        let path = PropertyPath::Sequence(vec![
            PropertyPath::OneOrMore(Box::new(PropertyPath::Predicate(knows.clone()))),
            PropertyPath::Alternative(vec![
                PropertyPath::Predicate(name.clone()),
                PropertyPath::Predicate(knows.clone()),
            ]),
        ]);
        assert_eq!(path.predicates(), vec![&knows, &name]);
    }

    #[test]
    fn test_in_scope_variables_skip_optional_right() {
        let pattern = GraphPattern::optional(
            GraphPattern::group(vec![GraphPattern::triple(
                Term::var("s"),
                foaf("name"),
                Term::var("n"),
            )]),
            GraphPattern::group(vec![GraphPattern::triple(
                Term::var("s"),
                foaf("mbox"),
                Term::var("m"),
            )]),
        );
        let vars = pattern.in_scope_variables();
        assert!(vars.contains("s"));
        assert!(vars.contains("n"));
        assert!(!vars.contains("m"));
        assert!(pattern.variables().contains("m"));
    }

    #[test]
    fn test_query_serialization() {
        let mut query = Query::select_all(GraphPattern::group(vec![
            GraphPattern::Values(ValuesTable::single(
                "s".to_string(),
                vec![Term::iri("http://example.org/alice")],
            )),
            GraphPattern::triple(Term::var("s"), foaf("name"), Term::var("n")),
            GraphPattern::Filter(Expression::binary(
                BinaryOperator::NotEqual,
                Expression::var("n"),
                Expression::Literal(Literal::lang("Bob", "en")),
            )),
        ]));
        query.limit = Some(10);
        let text = query.to_string();
        assert_eq!(
            text,
            "SELECT * WHERE { VALUES (?s) { (<http://example.org/alice>) } \
             ?s <http://xmlns.com/foaf/0.1/name> ?n . FILTER((?n != \"Bob\"@en)) } LIMIT 10"
        );
    }

    #[test]
    fn test_service_serialization_uses_subselect_when_needed() {
        let mut service = ServicePattern::new(
            ServiceEndpoints::single(Iri::new("http://a.example/sparql")),
            vec![GraphPattern::triple(Term::var("s"), foaf("name"), Term::var("n"))],
        );
        assert_eq!(
            service.to_string(),
            "SERVICE <http://a.example/sparql> { ?s <http://xmlns.com/foaf/0.1/name> ?n . }"
        );
        service.body.limit = Some(5);
        assert!(service.to_string().contains("{ SELECT * WHERE"));
        assert!(service.to_string().ends_with("LIMIT 5 }"));
    }

    #[test]
    fn test_literal_escaping() {
        let lit = Literal::simple("say \"hi\"\n");
        assert_eq!(lit.to_string(), "\"say \\\"hi\\\"\\n\"");
    }

    #[test]
    fn test_unconstrained_binding_sets() {
        assert!(is_unconstrained(None));
        let empty: BindingSet = Vec::new();
        assert!(is_unconstrained(Some(empty.as_slice())));
        let blank: BindingSet = vec![Binding::new()];
        assert!(is_unconstrained(Some(blank.as_slice())));
        let mut b = Binding::new();
        b.insert("s".to_string(), Term::iri("http://example.org/a"));
        let bound: BindingSet = vec![b];
        assert!(!is_unconstrained(Some(bound.as_slice())));
    }
}
