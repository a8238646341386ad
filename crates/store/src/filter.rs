//! Translation of the user-facing filter expression language into
//! parameterized SQL, plus in-memory evaluation of the same expressions for
//! watch streams.
//!
//! The language is the boolean subset exposed to clients: `&&`, `||`, `!`,
//! parenthesized groups, and comparisons between a field path and a string,
//! number or boolean literal. Field paths resolve either to a dedicated
//! column (`id`, `metadata.creation_timestamp`, `metadata.deletion_timestamp`)
//! or to a JSON path into the payload. Literals never reach the SQL text;
//! every one becomes a `$N` bind parameter.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    Syntax(String),
    UnknownField(String),
    TypeMismatch(String),
    UnsupportedOperator(String),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Syntax(message) => write!(f, "syntax error: {}", message),
            FilterError::UnknownField(message) => write!(f, "{}", message),
            FilterError::TypeMismatch(message) => write!(f, "{}", message),
            FilterError::UnsupportedOperator(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for FilterError {}

/// A bind value produced by the translation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    TextArray(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        path: Vec<String>,
        op: CompareOp,
        literal: Literal,
    },
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    root: Expr,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::Syntax(format!(
                "unexpected trailing input at token {}",
                parser.pos + 1
            )));
        }
        Ok(Self { root })
    }

    /// Emits the SQL fragment and its bind parameters. `fields` lists the
    /// payload root fields the entity allows; `param_offset` is the number
    /// of `$N` parameters the caller has already allocated.
    pub fn to_sql(
        &self,
        fields: &[&str],
        param_offset: usize,
    ) -> Result<Translation, FilterError> {
        let mut out = Translation {
            sql: String::new(),
            params: Vec::new(),
        };
        emit(&self.root, fields, param_offset, &mut out)?;
        Ok(out)
    }

    /// Evaluates the expression against the JSON form of an object. Used by
    /// watch streams, which cannot push the predicate into SQL.
    pub fn matches(&self, object: &serde_json::Value) -> bool {
        eval(&self.root, object)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Dot,
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Bang,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn lex(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let chars = input.chars().collect::<Vec<_>>();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(FilterError::Syntax("expected `&&`".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(FilterError::Syntax("expected `||`".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(FilterError::Syntax("expected `==`".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            value.push(c);
                            i += 1;
                        }
                        None => {
                            return Err(FilterError::Syntax(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' | '-' => {
                let start = i;
                if c == '-' {
                    i += 1;
                }
                let mut is_float = false;
                while let Some(&c) = chars.get(i) {
                    if c.is_ascii_digit() {
                        i += 1;
                    } else if c == '.' && !is_float && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text = chars[start..i].iter().collect::<String>();
                if is_float {
                    let value = text.parse::<f64>().map_err(|_| {
                        FilterError::Syntax(format!("invalid number literal `{}`", text))
                    })?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text.parse::<i64>().map_err(|_| {
                        FilterError::Syntax(format!("invalid number literal `{}`", text))
                    })?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while let Some(&c) = chars.get(i) {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(FilterError::Syntax(format!(
                    "unexpected character `{}`",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Literal(Literal),
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.next();
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FilterError::Syntax("expected `)`".to_string())),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Err(FilterError::Syntax("expected comparison operator".to_string())),
        };
        let right = self.parse_operand()?;
        match (left, right) {
            (Operand::Path(path), Operand::Literal(literal)) => {
                Ok(Expr::Compare { path, op, literal })
            }
            // Literal-first comparisons are normalized by flipping.
            (Operand::Literal(literal), Operand::Path(path)) => Ok(Expr::Compare {
                path,
                op: op.flip(),
                literal,
            }),
            (Operand::Path(_), Operand::Path(_)) => Err(FilterError::UnsupportedOperator(
                "comparison between two fields is not supported".to_string(),
            )),
            (Operand::Literal(_), Operand::Literal(_)) => Err(FilterError::UnsupportedOperator(
                "comparison between two literals is not supported".to_string(),
            )),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, FilterError> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Operand::Literal(Literal::Str(value))),
            Some(Token::Int(value)) => Ok(Operand::Literal(Literal::Int(value))),
            Some(Token::Float(value)) => Ok(Operand::Literal(Literal::Float(value))),
            Some(Token::Ident(name)) if name == "true" => {
                Ok(Operand::Literal(Literal::Bool(true)))
            }
            Some(Token::Ident(name)) if name == "false" => {
                Ok(Operand::Literal(Literal::Bool(false)))
            }
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => {
                            return Err(FilterError::Syntax(
                                "expected field name after `.`".to_string(),
                            ))
                        }
                    }
                }
                Ok(Operand::Path(path))
            }
            _ => Err(FilterError::Syntax("expected field or literal".to_string())),
        }
    }
}

enum Column<'a> {
    Id,
    Timestamp(&'static str),
    Json(&'a [String]),
}

fn resolve<'a>(path: &'a [String], fields: &[&str]) -> Result<Column<'a>, FilterError> {
    let joined = path.join(".");
    match path {
        [first] if first == "id" => Ok(Column::Id),
        [first, second] if first == "metadata" => match second.as_str() {
            "creation_timestamp" => Ok(Column::Timestamp("creation_timestamp")),
            "deletion_timestamp" => Ok(Column::Timestamp("deletion_timestamp")),
            "finalizers" | "creators" | "tenants" => Err(FilterError::UnsupportedOperator(
                format!("cannot compare array field '{}'", joined),
            )),
            _ => Err(FilterError::UnknownField(format!(
                "unknown field '{}'",
                joined
            ))),
        },
        [first, ..] if fields.contains(&first.as_str()) => Ok(Column::Json(path)),
        _ => Err(FilterError::UnknownField(format!(
            "unknown field '{}'",
            joined
        ))),
    }
}

fn json_path(path: &[String]) -> String {
    format!("(data #>> '{{{}}}')", path.join(","))
}

fn emit(
    expr: &Expr,
    fields: &[&str],
    param_offset: usize,
    out: &mut Translation,
) -> Result<(), FilterError> {
    match expr {
        Expr::And(left, right) => {
            out.sql.push('(');
            emit(left, fields, param_offset, out)?;
            out.sql.push_str(" and ");
            emit(right, fields, param_offset, out)?;
            out.sql.push(')');
            Ok(())
        }
        Expr::Or(left, right) => {
            out.sql.push('(');
            emit(left, fields, param_offset, out)?;
            out.sql.push_str(" or ");
            emit(right, fields, param_offset, out)?;
            out.sql.push(')');
            Ok(())
        }
        Expr::Not(inner) => {
            out.sql.push_str("not (");
            emit(inner, fields, param_offset, out)?;
            out.sql.push(')');
            Ok(())
        }
        Expr::Compare { path, op, literal } => {
            emit_compare(path, *op, literal, fields, param_offset, out)
        }
    }
}

fn emit_compare(
    path: &[String],
    op: CompareOp,
    literal: &Literal,
    fields: &[&str],
    param_offset: usize,
    out: &mut Translation,
) -> Result<(), FilterError> {
    let joined = path.join(".");
    match resolve(path, fields)? {
        Column::Id => match literal {
            Literal::Str(value) => {
                out.params.push(SqlParam::Text(value.clone()));
                out.sql
                    .push_str(&format!("id {} ${}", op.sql(), param_offset + out.params.len()));
                Ok(())
            }
            _ => Err(FilterError::TypeMismatch(format!(
                "field '{}' requires a string literal",
                joined
            ))),
        },
        Column::Timestamp(column) => match literal {
            Literal::Str(value) => {
                let parsed = DateTime::parse_from_rfc3339(value).map_err(|_| {
                    FilterError::TypeMismatch(format!(
                        "field '{}' requires an RFC 3339 timestamp literal",
                        joined
                    ))
                })?;
                out.params
                    .push(SqlParam::Timestamp(parsed.with_timezone(&Utc)));
                out.sql.push_str(&format!(
                    "{} {} ${}",
                    column,
                    op.sql(),
                    param_offset + out.params.len()
                ));
                Ok(())
            }
            _ => Err(FilterError::TypeMismatch(format!(
                "field '{}' requires an RFC 3339 timestamp literal",
                joined
            ))),
        },
        Column::Json(path) => {
            let accessor = json_path(path);
            match literal {
                Literal::Str(value) => {
                    out.params.push(SqlParam::Text(value.clone()));
                    out.sql.push_str(&format!(
                        "{} {} ${}",
                        accessor,
                        op.sql(),
                        param_offset + out.params.len()
                    ));
                    Ok(())
                }
                Literal::Int(value) => {
                    out.params.push(SqlParam::Int(*value));
                    out.sql.push_str(&format!(
                        "{}::numeric {} ${}",
                        accessor,
                        op.sql(),
                        param_offset + out.params.len()
                    ));
                    Ok(())
                }
                Literal::Float(value) => {
                    out.params.push(SqlParam::Float(*value));
                    out.sql.push_str(&format!(
                        "{}::numeric {} ${}",
                        accessor,
                        op.sql(),
                        param_offset + out.params.len()
                    ));
                    Ok(())
                }
                Literal::Bool(value) => {
                    if op != CompareOp::Eq && op != CompareOp::Ne {
                        return Err(FilterError::UnsupportedOperator(format!(
                            "field '{}' only supports equality against booleans",
                            joined
                        )));
                    }
                    out.params.push(SqlParam::Bool(*value));
                    out.sql.push_str(&format!(
                        "{}::boolean {} ${}",
                        accessor,
                        op.sql(),
                        param_offset + out.params.len()
                    ));
                    Ok(())
                }
            }
        }
    }
}

fn eval(expr: &Expr, object: &serde_json::Value) -> bool {
    match expr {
        Expr::And(left, right) => eval(left, object) && eval(right, object),
        Expr::Or(left, right) => eval(left, object) || eval(right, object),
        Expr::Not(inner) => !eval(inner, object),
        Expr::Compare { path, op, literal } => {
            let mut current = object;
            for segment in path {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return *op == CompareOp::Ne,
                }
            }
            compare_value(current, *op, literal)
        }
    }
}

fn compare_value(value: &serde_json::Value, op: CompareOp, literal: &Literal) -> bool {
    use std::cmp::Ordering;

    let ordering = match (value, literal) {
        (serde_json::Value::String(v), Literal::Str(l)) => Some(v.as_str().cmp(l.as_str())),
        (serde_json::Value::Number(v), Literal::Int(l)) => {
            v.as_f64().and_then(|v| v.partial_cmp(&(*l as f64)))
        }
        (serde_json::Value::Number(v), Literal::Float(l)) => {
            v.as_f64().and_then(|v| v.partial_cmp(l))
        }
        (serde_json::Value::Bool(v), Literal::Bool(l)) => Some(v.cmp(l)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return op == CompareOp::Ne;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: &[&str] = &["spec", "status", "title"];

    fn translate(input: &str) -> Result<Translation, FilterError> {
        Filter::parse(input)?.to_sql(FIELDS, 0)
    }

    #[test]
    fn id_comparison_uses_the_dedicated_column() {
        let t = translate("id == 'c1'").expect("filter should translate");
        assert_eq!(t.sql, "id = $1");
        assert_eq!(t.params, vec![SqlParam::Text("c1".to_string())]);
    }

    #[test]
    fn payload_fields_use_json_paths() {
        let t = translate("spec.template == 'small'").expect("filter should translate");
        assert_eq!(t.sql, "(data #>> '{spec,template}') = $1");
        assert_eq!(t.params, vec![SqlParam::Text("small".to_string())]);
    }

    #[test]
    fn numeric_comparisons_cast_the_json_path() {
        let t = translate("spec.node_sets.worker.size >= 3").expect("filter should translate");
        assert_eq!(
            t.sql,
            "(data #>> '{spec,node_sets,worker,size}')::numeric >= $1"
        );
        assert_eq!(t.params, vec![SqlParam::Int(3)]);
    }

    #[test]
    fn boolean_operators_compose_with_binds_in_order() {
        let t = translate("spec.template == 'small' && !(status.state == 'READY' || id == 'x')")
            .expect("filter should translate");
        assert_eq!(
            t.sql,
            "((data #>> '{spec,template}') = $1 and not (((data #>> '{status,state}') = $2 or id = $3)))"
        );
        assert_eq!(t.params.len(), 3);
    }

    #[test]
    fn literal_first_comparison_is_flipped() {
        let t = translate("3 < spec.node_sets.worker.size").expect("filter should translate");
        assert_eq!(
            t.sql,
            "(data #>> '{spec,node_sets,worker,size}')::numeric > $1"
        );
    }

    #[test]
    fn parameter_offset_shifts_placeholders() {
        let t = Filter::parse("id == 'c1'")
            .expect("filter should parse")
            .to_sql(FIELDS, 2)
            .expect("filter should translate");
        assert_eq!(t.sql, "id = $3");
    }

    #[test]
    fn timestamp_fields_require_timestamp_literals() {
        let t = translate("metadata.creation_timestamp < '2025-06-01T00:00:00Z'")
            .expect("filter should translate");
        assert_eq!(t.sql, "creation_timestamp < $1");
        assert!(matches!(t.params[0], SqlParam::Timestamp(_)));

        let err = translate("metadata.creation_timestamp < 5").unwrap_err();
        assert!(matches!(err, FilterError::TypeMismatch(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = translate("nonsense == 'x'").unwrap_err();
        assert_eq!(
            err,
            FilterError::UnknownField("unknown field 'nonsense'".to_string())
        );

        let err = translate("metadata.owner == 'x'").unwrap_err();
        assert!(matches!(err, FilterError::UnknownField(_)));
    }

    #[test]
    fn array_metadata_fields_are_rejected() {
        let err = translate("metadata.tenants == 'shared'").unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedOperator(_)));
    }

    #[test]
    fn id_requires_string_literal() {
        let err = translate("id == 42").unwrap_err();
        assert!(matches!(err, FilterError::TypeMismatch(_)));
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = Filter::parse("id == 'oops").unwrap_err();
        assert!(matches!(err, FilterError::Syntax(_)));
    }

    #[test]
    fn in_memory_evaluation_matches_translation_semantics() {
        let object = serde_json::json!({
            "id": "c1",
            "spec": {"template": "small", "node_sets": {"worker": {"size": 3}}},
            "status": {"state": "READY"},
        });

        let filter = Filter::parse("spec.template == 'small' && status.state == 'READY'")
            .expect("filter should parse");
        assert!(filter.matches(&object));

        let filter =
            Filter::parse("spec.node_sets.worker.size > 5").expect("filter should parse");
        assert!(!filter.matches(&object));

        let filter = Filter::parse("spec.missing != 'x'").expect("filter should parse");
        assert!(filter.matches(&object));
    }
}
