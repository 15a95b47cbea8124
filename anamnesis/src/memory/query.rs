//! Read-only fact queries.
//!
//! A [`FactQuery`] describes one relationship pattern: an optional subject
//! pattern, predicate and target pattern, plus confidence/provenance filters,
//! ordering and a limit. Queries can be built programmatically or parsed from a
//! compact textual form:
//!
//! ```text
//! (Person {name: "John Smith"})-[worksAt]->(Organization)
//!     WHERE confidence >= 0.5 AND source = "chat"
//!     ORDER BY confidence DESC
//!     LIMIT 10
//! ```
//!
//! `()` and `[]` (or `[*]`) match anything; `(#<id>)` pins an entity id.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::str::FromStr;

use super::types::{
    Entity, EntityId, FactRecord, Properties, validate_confidence, validate_properties,
};

/// Error produced when a textual query cannot be parsed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid query at offset {offset}: {message}")]
pub struct QueryParseError {
    pub offset: usize,
    pub message: String,
}

impl QueryParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl From<QueryParseError> for crate::AnamnesisError {
    fn from(err: QueryParseError) -> Self {
        crate::AnamnesisError::Validation(err.to_string())
    }
}

/// Pattern matched against one endpoint of a relationship
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPattern {
    /// Exact entity id
    pub id: Option<EntityId>,
    /// Exact entity type
    pub entity_type: Option<String>,
    /// Properties that must be present with equal values (other properties are ignored)
    pub properties: Properties,
}

impl EntityPattern {
    /// Pattern matching any entity
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Self::default()
        }
    }

    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(id) = &self.id
            && id != &entity.id
        {
            return false;
        }
        if let Some(entity_type) = &self.entity_type
            && entity_type != &entity.entity_type
        {
            return false;
        }
        self.properties
            .iter()
            .all(|(key, value)| entity.properties.get(key) == Some(value))
    }

    fn validate(&self, role: &str) -> Result<(), String> {
        if let Some(entity_type) = &self.entity_type
            && entity_type.trim().is_empty()
        {
            return Err(format!("{} type cannot be empty", role));
        }
        validate_properties(&self.properties).map_err(|e| format!("{}: {}", role, e))
    }
}

/// Sort direction for ordered queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Field a query can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactOrderField {
    Confidence,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactOrder {
    pub field: FactOrderField,
    pub direction: SortDirection,
}

/// A single-pattern fact query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactQuery {
    pub subject: EntityPattern,
    pub predicate: Option<String>,
    pub target: EntityPattern,
    pub min_confidence: Option<f64>,
    pub source: Option<String>,
    pub order: Option<FactOrder>,
    pub limit: Option<usize>,
}

impl FactQuery {
    /// Query matching every committed relationship
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the textual query form described in the module docs
    pub fn parse(expression: &str) -> Result<Self, QueryParseError> {
        let tokens = tokenize(expression)?;
        Parser {
            tokens,
            pos: 0,
            end: expression.len(),
        }
        .parse_query()
    }

    pub fn subject(mut self, pattern: EntityPattern) -> Self {
        self.subject = pattern;
        self
    }

    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn target(mut self, pattern: EntityPattern) -> Self {
        self.target = pattern;
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn order_by(mut self, field: FactOrderField, direction: SortDirection) -> Self {
        self.order = Some(FactOrder { field, direction });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject queries that could never be meaningful, before any backend call
    pub fn validate(&self) -> Result<(), String> {
        self.subject.validate("subject")?;
        self.target.validate("target")?;
        if let Some(predicate) = &self.predicate
            && predicate.trim().is_empty()
        {
            return Err("predicate cannot be empty".to_string());
        }
        if let Some(confidence) = self.min_confidence {
            validate_confidence(confidence)?;
        }
        if self.limit == Some(0) {
            return Err("limit must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Entity ids pinned by the subject/target patterns
    pub fn pinned_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.subject.id.iter().chain(self.target.id.iter())
    }

    /// Whether a record satisfies the pattern and filters (ordering and limit aside)
    pub fn matches(&self, record: &FactRecord) -> bool {
        let relationship = &record.relationship;
        if let Some(predicate) = &self.predicate
            && predicate != &relationship.predicate
        {
            return false;
        }
        if let Some(min) = self.min_confidence
            && relationship.confidence < min
        {
            return false;
        }
        if let Some(source) = &self.source
            && source != &relationship.source
        {
            return false;
        }
        self.subject.matches(&record.subject) && self.target.matches(&record.target)
    }

    /// Apply the requested ordering; without one the backend order is kept
    pub fn sort(&self, records: &mut [FactRecord]) {
        let Some(order) = self.order else {
            return;
        };
        records.sort_by(|a, b| {
            let ordering = match order.field {
                FactOrderField::Confidence => a
                    .relationship
                    .confidence
                    .partial_cmp(&b.relationship.confidence)
                    .unwrap_or(Ordering::Equal),
                FactOrderField::Created => a
                    .relationship
                    .created_at
                    .cmp(&b.relationship.created_at),
            };
            match order.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
    }
}

impl FromStr for FactQuery {
    type Err = QueryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactQuery::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dash,
    Arrow,
    Star,
    Gte,
    Eq,
    Id(String),
    Ident(String),
    Str(String),
    Num(Number),
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, QueryParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ':' | ',' | '*' | '=' => {
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    ':' => Token::Colon,
                    ',' => Token::Comma,
                    '*' => Token::Star,
                    _ => Token::Eq,
                };
                tokens.push((offset, token));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push((offset, Token::Gte));
                i += 2;
            }
            '-' if next == Some('>') => {
                tokens.push((offset, Token::Arrow));
                i += 2;
            }
            '-' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let (number, consumed) = read_number(&chars, i)?;
                tokens.push((offset, Token::Num(number)));
                i += consumed;
            }
            '-' => {
                tokens.push((offset, Token::Dash));
                i += 1;
            }
            '#' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && !chars[end].1.is_whitespace() && chars[end].1 != ')' {
                    end += 1;
                }
                if end == start {
                    return Err(QueryParseError::new(offset, "expected entity id after '#'"));
                }
                let id: String = chars[start..end].iter().map(|(_, c)| c).collect();
                tokens.push((offset, Token::Id(id)));
                i = end;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => {
                            return Err(QueryParseError::new(offset, "unterminated string"));
                        }
                        Some((_, '\\')) => {
                            match chars.get(j + 1) {
                                Some((_, escaped)) => value.push(*escaped),
                                None => {
                                    return Err(QueryParseError::new(
                                        offset,
                                        "unterminated string",
                                    ));
                                }
                            }
                            j += 2;
                        }
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => {
                            value.push(*ch);
                            j += 1;
                        }
                    }
                }
                tokens.push((offset, Token::Str(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let (number, consumed) = read_number(&chars, i)?;
                tokens.push((offset, Token::Num(number)));
                i += consumed;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                    j += 1;
                }
                let ident: String = chars[i..j].iter().map(|(_, c)| c).collect();
                tokens.push((offset, Token::Ident(ident)));
                i = j;
            }
            other => {
                return Err(QueryParseError::new(
                    offset,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

fn read_number(chars: &[(usize, char)], start: usize) -> Result<(Number, usize), QueryParseError> {
    let mut j = start;
    if chars[j].1 == '-' {
        j += 1;
    }
    while j < chars.len()
        && (chars[j].1.is_ascii_digit() || matches!(chars[j].1, '.' | 'e' | 'E'))
    {
        j += 1;
    }
    let text: String = chars[start..j].iter().map(|(_, c)| c).collect();
    let offset = chars[start].0;

    let number = if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .ok_or_else(|| QueryParseError::new(offset, format!("invalid number '{}'", text)))?
    } else {
        text.parse::<i64>()
            .map(Number::from)
            .map_err(|_| QueryParseError::new(offset, format!("invalid number '{}'", text)))?
    };
    Ok((number, j - start))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn parse_query(mut self) -> Result<FactQuery, QueryParseError> {
        let mut query = FactQuery::new();

        query.subject = self.parse_node()?;
        self.expect(Token::Dash, "'-'")?;
        self.expect(Token::LBracket, "'['")?;
        match self.next() {
            Some((_, Token::RBracket)) => {}
            Some((_, Token::Star)) => self.expect(Token::RBracket, "']'")?,
            Some((_, Token::Ident(predicate))) => {
                query.predicate = Some(predicate);
                self.expect(Token::RBracket, "']'")?;
            }
            other => return Err(self.unexpected(other, "predicate")),
        }
        self.expect(Token::Arrow, "'->'")?;
        query.target = self.parse_node()?;

        while let Some((offset, token)) = self.next() {
            match token {
                Token::Ident(word) if word.eq_ignore_ascii_case("where") => {
                    self.parse_condition(&mut query)?;
                    while self.peek_keyword("and") {
                        self.pos += 1;
                        self.parse_condition(&mut query)?;
                    }
                }
                Token::Ident(word) if word.eq_ignore_ascii_case("order") => {
                    self.expect_keyword("by")?;
                    let field = match self.next() {
                        Some((_, Token::Ident(f))) if f.eq_ignore_ascii_case("confidence") => {
                            FactOrderField::Confidence
                        }
                        Some((_, Token::Ident(f)))
                            if f.eq_ignore_ascii_case("created")
                                || f.eq_ignore_ascii_case("created_at") =>
                        {
                            FactOrderField::Created
                        }
                        other => return Err(self.unexpected(other, "'confidence' or 'created'")),
                    };
                    let direction = if self.peek_keyword("desc") {
                        self.pos += 1;
                        SortDirection::Descending
                    } else {
                        if self.peek_keyword("asc") {
                            self.pos += 1;
                        }
                        SortDirection::Ascending
                    };
                    query.order = Some(FactOrder { field, direction });
                }
                Token::Ident(word) if word.eq_ignore_ascii_case("limit") => match self.next() {
                    Some((offset, Token::Num(n))) => {
                        let limit = n
                            .as_u64()
                            .filter(|n| *n > 0)
                            .ok_or_else(|| {
                                QueryParseError::new(offset, "limit must be a positive integer")
                            })?;
                        query.limit = Some(limit as usize);
                    }
                    other => return Err(self.unexpected(other, "limit value")),
                },
                other => {
                    return Err(QueryParseError::new(
                        offset,
                        format!("unexpected {:?}, expected WHERE, ORDER BY or LIMIT", other),
                    ));
                }
            }
        }

        query
            .validate()
            .map_err(|message| QueryParseError::new(0, message))?;
        Ok(query)
    }

    fn parse_node(&mut self) -> Result<EntityPattern, QueryParseError> {
        self.expect(Token::LParen, "'('")?;
        let mut pattern = EntityPattern::any();

        loop {
            match self.next() {
                Some((_, Token::RParen)) => return Ok(pattern),
                Some((offset, Token::Id(id))) => {
                    if pattern.id.is_some() {
                        return Err(QueryParseError::new(offset, "entity id given twice"));
                    }
                    pattern.id = Some(EntityId::new(id));
                }
                Some((offset, Token::Ident(entity_type))) => {
                    if pattern.entity_type.is_some() {
                        return Err(QueryParseError::new(offset, "entity type given twice"));
                    }
                    pattern.entity_type = Some(entity_type);
                }
                Some((_, Token::LBrace)) => {
                    pattern.properties = self.parse_properties()?;
                }
                other => return Err(self.unexpected(other, "entity type, '{' or ')'")),
            }
        }
    }

    fn parse_properties(&mut self) -> Result<Properties, QueryParseError> {
        let mut properties = Properties::new();
        if matches!(self.peek(), Some(Token::RBrace)) {
            self.pos += 1;
            return Ok(properties);
        }
        loop {
            let key = match self.next() {
                Some((_, Token::Ident(key))) => key,
                Some((_, Token::Str(key))) => key,
                other => return Err(self.unexpected(other, "property name")),
            };
            self.expect(Token::Colon, "':'")?;
            let value = match self.next() {
                Some((_, Token::Str(s))) => Value::String(s),
                Some((_, Token::Num(n))) => Value::Number(n),
                Some((_, Token::Ident(word))) if word == "true" => Value::Bool(true),
                Some((_, Token::Ident(word))) if word == "false" => Value::Bool(false),
                other => return Err(self.unexpected(other, "string, number or bool")),
            };
            properties.insert(key, value);
            match self.next() {
                Some((_, Token::Comma)) => continue,
                Some((_, Token::RBrace)) => return Ok(properties),
                other => return Err(self.unexpected(other, "',' or '}'")),
            }
        }
    }

    fn parse_condition(&mut self, query: &mut FactQuery) -> Result<(), QueryParseError> {
        match self.next() {
            Some((_, Token::Ident(field))) if field.eq_ignore_ascii_case("confidence") => {
                self.expect(Token::Gte, "'>='")?;
                match self.next() {
                    Some((_, Token::Num(n))) => {
                        query.min_confidence = n.as_f64();
                        Ok(())
                    }
                    other => Err(self.unexpected(other, "confidence value")),
                }
            }
            Some((_, Token::Ident(field))) if field.eq_ignore_ascii_case("source") => {
                self.expect(Token::Eq, "'='")?;
                match self.next() {
                    Some((_, Token::Str(source))) => {
                        query.source = Some(source);
                        Ok(())
                    }
                    other => Err(self.unexpected(other, "quoted source")),
                }
            }
            other => Err(self.unexpected(other, "'confidence' or 'source'")),
        }
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), QueryParseError> {
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            other => Err(self.unexpected(other, what)),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), QueryParseError> {
        match self.next() {
            Some((_, Token::Ident(word))) if word.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(self.unexpected(other, keyword)),
        }
    }

    fn unexpected(&self, found: Option<(usize, Token)>, expected: &str) -> QueryParseError {
        match found {
            Some((offset, token)) => QueryParseError::new(
                offset,
                format!("expected {}, found {:?}", expected, token),
            ),
            None => QueryParseError::new(
                self.end,
                format!("expected {}, found end of input", expected),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Relationship, RelationshipId};
    use chrono::Utc;
    use serde_json::json;

    fn entity(id: &str, entity_type: &str, properties: Value) -> Entity {
        Entity {
            id: EntityId::new(id),
            entity_type: entity_type.to_string(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            created_at: Utc::now(),
        }
    }

    fn record(confidence: f64) -> FactRecord {
        let subject = entity("p1", "Person", json!({"name": "John Smith", "age": 42}));
        let target = entity("o1", "Organization", json!({"name": "Acme"}));
        FactRecord {
            relationship: Relationship {
                id: RelationshipId::new("r1"),
                subject_id: subject.id.clone(),
                predicate: "worksAt".to_string(),
                target_id: target.id.clone(),
                confidence,
                source: "chat".to_string(),
                properties: Properties::new(),
                created_at: Utc::now(),
            },
            subject,
            target,
        }
    }

    #[test]
    fn test_parse_full_expression() {
        let query = FactQuery::parse(
            r#"(Person {name: "John Smith"})-[worksAt]->(Organization)
               WHERE confidence >= 0.5 AND source = "chat"
               ORDER BY confidence DESC LIMIT 10"#,
        )
        .unwrap();

        assert_eq!(query.subject.entity_type.as_deref(), Some("Person"));
        assert_eq!(query.subject.properties["name"], json!("John Smith"));
        assert_eq!(query.predicate.as_deref(), Some("worksAt"));
        assert_eq!(query.target.entity_type.as_deref(), Some("Organization"));
        assert_eq!(query.min_confidence, Some(0.5));
        assert_eq!(query.source.as_deref(), Some("chat"));
        assert_eq!(
            query.order,
            Some(FactOrder {
                field: FactOrderField::Confidence,
                direction: SortDirection::Descending
            })
        );
        assert_eq!(query.limit, Some(10));
        assert!(query.matches(&record(0.9)));
        assert!(!query.matches(&record(0.1)));
    }

    #[test]
    fn test_parse_wildcards_and_pinned_id() {
        let query = FactQuery::parse("()-[*]->(#o1)").unwrap();
        assert!(query.predicate.is_none());
        assert_eq!(query.target.id, Some(EntityId::new("o1")));
        assert_eq!(query.pinned_ids().count(), 1);
        assert!(query.matches(&record(1.0)));

        let query: FactQuery = "()-[]->()".parse().unwrap();
        assert_eq!(query, FactQuery::new());
    }

    #[test]
    fn test_property_pattern_is_subset_match() {
        let query = FactQuery::parse("(Person {age: 42})-[worksAt]->()").unwrap();
        assert!(query.matches(&record(1.0)));

        let query = FactQuery::parse("(Person {age: 43})-[worksAt]->()").unwrap();
        assert!(!query.matches(&record(1.0)));
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        for expression in [
            "",
            "(Person",
            "(Person)-[worksAt](Organization)",
            "(Person)-[worksAt]->(Organization) LIMIT 0",
            "(Person)-[worksAt]->(Organization) WHERE confidence >= 1.5",
            "(Person {name: })-[worksAt]->()",
            "(Person {name: \"John})-[worksAt]->()",
            "(Person)-[worksAt]->() ORDER BY name",
            "(Person)-[worksAt]->() GROUP BY confidence",
            "(Person Person)-[worksAt]->()",
        ] {
            assert!(
                FactQuery::parse(expression).is_err(),
                "expected parse failure for {expression:?}"
            );
        }
    }

    #[test]
    fn test_sort_by_confidence() {
        let query = FactQuery::new().order_by(FactOrderField::Confidence, SortDirection::Ascending);
        let mut records = vec![record(0.9), record(0.2), record(0.5)];
        query.sort(&mut records);
        let confidences: Vec<f64> = records.iter().map(|r| r.relationship.confidence).collect();
        assert_eq!(confidences, vec![0.2, 0.5, 0.9]);
    }

    #[test]
    fn test_builder_validation() {
        assert!(FactQuery::new().predicate(" ").validate().is_err());
        assert!(FactQuery::new().limit(0).validate().is_err());
        assert!(FactQuery::new().min_confidence(-0.1).validate().is_err());
        assert!(
            FactQuery::new()
                .subject(EntityPattern::of_type("Person").property("tags", json!(["a"])))
                .validate()
                .is_err()
        );
        assert!(FactQuery::new().predicate("worksAt").limit(5).validate().is_ok());
    }
}
