// ============================================================================
// SQL subset understood by the in-memory engine
// ============================================================================
//
// Session and transaction control (BEGIN, COMMIT, ROLLBACK, savepoints, SET,
// SHOW) is matched directly. Everything else goes through `sqlparser` with
// the PostgreSQL dialect and is lowered into the small statement tree below.
// Parse failures carry SQLSTATE 42601, constructs outside the subset 0A000.
//
// ============================================================================

use crate::core::{DriverError, Error, Result, Value, codes};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

lazy_static! {
    static ref BEGIN_RE: Regex =
        Regex::new(r"(?is)^(?:BEGIN|START\s+TRANSACTION)(?:\s+(?:TRANSACTION|WORK))?(?:\s+(?P<modes>.*))?$").unwrap();
    static ref COMMIT_RE: Regex = Regex::new(r"(?is)^(?:COMMIT|END)(?:\s+(?:TRANSACTION|WORK))?$").unwrap();
    static ref ROLLBACK_TO_RE: Regex = Regex::new(
        r"(?is)^ROLLBACK(?:\s+(?:TRANSACTION|WORK))?\s+TO\s+(?:SAVEPOINT\s+)?(?P<name>\w+)$"
    )
    .unwrap();
    static ref ROLLBACK_RE: Regex = Regex::new(r"(?is)^(?:ROLLBACK|ABORT)(?:\s+(?:TRANSACTION|WORK))?$").unwrap();
    static ref SAVEPOINT_RE: Regex = Regex::new(r"(?is)^SAVEPOINT\s+(?P<name>\w+)$").unwrap();
    static ref RELEASE_RE: Regex = Regex::new(r"(?is)^RELEASE\s+(?:SAVEPOINT\s+)?(?P<name>\w+)$").unwrap();
    static ref SET_RE: Regex = Regex::new(
        r"(?is)^SET\s+(?:(?P<scope>LOCAL|SESSION)\s+)?(?P<name>\w+)\s*(?:=|\sTO\s)\s*(?P<value>.+)$"
    )
    .unwrap();
    static ref SHOW_RE: Regex = Regex::new(r"(?is)^SHOW\s+(?P<name>\w+)$").unwrap();
}

#[derive(Debug, Clone)]
pub(super) enum Expr {
    Literal(Value),
    /// 1-based bind parameter.
    Param(usize),
    Column(String),
    Cast(Box<Expr>, String),
    Now,
    CurrentDatabase,
    CurrentSetting(String),
    Sleep(Box<Expr>),
}

#[derive(Debug, Clone)]
pub(super) enum Projection {
    Wildcard,
    Count { name: String },
    Expr { expr: Expr, name: String },
}

#[derive(Debug, Clone)]
pub(super) struct ColumnSpec {
    pub name: String,
    pub serial: bool,
    pub unique: bool,
}

/// One `column = expr` conjunct of a WHERE clause.
#[derive(Debug, Clone)]
pub(super) struct Filter {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, Default)]
pub(super) struct TxModes {
    pub read_only: bool,
    pub isolation: Option<String>,
    pub deferrable: bool,
}

#[derive(Debug, Clone)]
pub(super) enum Statement {
    Begin(TxModes),
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
    Set {
        local: bool,
        name: String,
        value: String,
    },
    Show(String),
    CreateTable {
        name: String,
        columns: Vec<ColumnSpec>,
        if_not_exists: bool,
    },
    DropTable {
        names: Vec<String>,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
        returning: Option<Vec<Projection>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Vec<Filter>,
        returning: Option<Vec<Projection>>,
    },
    Delete {
        table: String,
        filter: Vec<Filter>,
        returning: Option<Vec<Projection>>,
    },
    Select {
        items: Vec<Projection>,
        from: Option<String>,
        filter: Vec<Filter>,
        order_by: Option<(String, bool)>,
        limit: Option<usize>,
    },
}

impl Statement {
    /// Statements still accepted inside an aborted transaction block.
    pub fn ends_block(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback | Self::RollbackTo(_))
    }

    /// Command tag used in read-only violations.
    pub fn write_tag(&self) -> Option<&'static str> {
        match self {
            Self::CreateTable { .. } => Some("CREATE TABLE"),
            Self::DropTable { .. } => Some("DROP TABLE"),
            Self::Insert { .. } => Some("INSERT"),
            Self::Update { .. } => Some("UPDATE"),
            Self::Delete { .. } => Some("DELETE"),
            _ => None,
        }
    }
}

fn syntax_error(message: impl Into<String>) -> Error {
    Error::Driver(DriverError::with_code(codes::SYNTAX_ERROR, message))
}

fn unsupported(what: impl std::fmt::Display) -> Error {
    Error::Driver(DriverError::with_code(
        codes::FEATURE_NOT_SUPPORTED,
        format!("{} is not supported", what),
    ))
}

pub(super) fn parse(sql: &str) -> Result<Statement> {
    let sql = sql.trim().trim_end_matches(';').trim();

    if let Some(stmt) = parse_control(sql) {
        return Ok(stmt);
    }

    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| syntax_error(e.to_string()))?;
    if statements.len() != 1 {
        return Err(syntax_error(
            "cannot insert multiple commands into a prepared statement",
        ));
    }
    match statements.pop() {
        Some(stmt) => convert_statement(stmt),
        None => Err(syntax_error("empty statement")),
    }
}

fn parse_control(sql: &str) -> Option<Statement> {
    if let Some(caps) = BEGIN_RE.captures(sql) {
        let modes = caps.name("modes").map(|m| m.as_str()).unwrap_or("");
        return Some(Statement::Begin(parse_modes(modes)));
    }
    if COMMIT_RE.is_match(sql) {
        return Some(Statement::Commit);
    }
    if let Some(caps) = ROLLBACK_TO_RE.captures(sql) {
        return Some(Statement::RollbackTo(caps["name"].to_lowercase()));
    }
    if ROLLBACK_RE.is_match(sql) {
        return Some(Statement::Rollback);
    }
    if let Some(caps) = SAVEPOINT_RE.captures(sql) {
        return Some(Statement::Savepoint(caps["name"].to_lowercase()));
    }
    if let Some(caps) = RELEASE_RE.captures(sql) {
        return Some(Statement::Release(caps["name"].to_lowercase()));
    }
    if let Some(caps) = SET_RE.captures(sql) {
        let local = caps
            .name("scope")
            .is_some_and(|s| s.as_str().eq_ignore_ascii_case("local"));
        let value = caps["value"].trim();
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .unwrap_or(value);
        return Some(Statement::Set {
            local,
            name: caps["name"].to_lowercase(),
            value: value.to_string(),
        });
    }
    if let Some(caps) = SHOW_RE.captures(sql) {
        return Some(Statement::Show(caps["name"].to_lowercase()));
    }
    None
}

fn parse_modes(modes: &str) -> TxModes {
    let upper = modes.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let isolation = [
        "SERIALIZABLE",
        "REPEATABLE READ",
        "READ COMMITTED",
        "READ UNCOMMITTED",
    ]
    .into_iter()
    .find(|level| upper.contains(&format!("ISOLATION LEVEL {}", level)))
    .map(str::to_lowercase);

    TxModes {
        read_only: upper.contains("READ ONLY"),
        isolation,
        deferrable: upper.contains("DEFERRABLE") && !upper.contains("NOT DEFERRABLE"),
    }
}

fn convert_statement(stmt: sql_ast::Statement) -> Result<Statement> {
    match stmt {
        sql_ast::Statement::CreateTable(create) => convert_create_table(create),
        sql_ast::Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if !matches!(object_type, sql_ast::ObjectType::Table) {
                return Err(unsupported(format!("DROP {}", object_type)));
            }
            let names = names
                .iter()
                .map(table_name)
                .collect::<Result<Vec<_>>>()?;
            Ok(Statement::DropTable { names, if_exists })
        }
        sql_ast::Statement::Insert(insert) => convert_insert(insert),
        sql_ast::Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => {
            let table = relation_name(table.relation)?;
            let assignments = assignments
                .into_iter()
                .map(|assign| {
                    let column = match assign.target {
                        sql_ast::AssignmentTarget::ColumnName(name) => table_name(&name)?,
                        other => return Err(unsupported(format!("assignment to {}", other))),
                    };
                    Ok((column, convert_expr(assign.value)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Statement::Update {
                table,
                assignments,
                filter: convert_filter(selection)?,
                returning: convert_returning(returning)?,
            })
        }
        sql_ast::Statement::Delete(delete) => {
            let tables = match delete.from {
                sql_ast::FromTable::WithFromKeyword(tables)
                | sql_ast::FromTable::WithoutKeyword(tables) => tables,
            };
            let Some(first) = tables.into_iter().next() else {
                return Err(syntax_error("DELETE requires a table"));
            };
            Ok(Statement::Delete {
                table: relation_name(first.relation)?,
                filter: convert_filter(delete.selection)?,
                returning: convert_returning(delete.returning)?,
            })
        }
        sql_ast::Statement::Query(query) => convert_query(*query),
        other => Err(unsupported(format!("statement \"{}\"", other))),
    }
}

fn convert_create_table(create: sql_ast::CreateTable) -> Result<Statement> {
    let name = table_name(&create.name)?;
    let columns = create
        .columns
        .into_iter()
        .map(|col| {
            let ty = col.data_type.to_string().to_uppercase();
            let options: Vec<String> = col
                .options
                .iter()
                .map(|opt| opt.option.to_string().to_uppercase())
                .collect();
            ColumnSpec {
                name: ident_name(&col.name),
                serial: matches!(ty.as_str(), "SERIAL" | "BIGSERIAL" | "SMALLSERIAL")
                    || options.iter().any(|o| o.contains("GENERATED")),
                unique: options
                    .iter()
                    .any(|o| o.contains("PRIMARY KEY") || o.contains("UNIQUE")),
            }
        })
        .collect::<Vec<_>>();
    if columns.is_empty() {
        return Err(unsupported("a table without columns"));
    }
    Ok(Statement::CreateTable {
        name,
        columns,
        if_not_exists: create.if_not_exists,
    })
}

fn convert_insert(insert: sql_ast::Insert) -> Result<Statement> {
    let table = normalize_name(&insert.table.to_string());
    let columns = if insert.columns.is_empty() {
        None
    } else {
        Some(insert.columns.iter().map(ident_name).collect())
    };

    let Some(source) = insert.source else {
        return Err(unsupported("INSERT without VALUES"));
    };
    let sql_ast::SetExpr::Values(values) = *source.body else {
        return Err(unsupported("INSERT from a query"));
    };
    let rows = values
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(convert_expr).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::Insert {
        table,
        columns,
        rows,
        returning: convert_returning(insert.returning)?,
    })
}

fn convert_query(query: sql_ast::Query) -> Result<Statement> {
    let order_by = convert_order_by(query.order_by)?;
    let limit = convert_limit(query.limit_clause)?;

    let sql_ast::SetExpr::Select(select) = *query.body else {
        return Err(unsupported("a set operation"));
    };
    let select = *select;

    let from = match select.from.len() {
        0 => None,
        1 => {
            let Some(table) = select.from.into_iter().next() else {
                return Err(syntax_error("missing FROM item"));
            };
            if !table.joins.is_empty() {
                return Err(unsupported("JOIN"));
            }
            Some(relation_name(table.relation)?)
        }
        _ => return Err(unsupported("a FROM list with several tables")),
    };

    let filter = convert_filter(select.selection)?;
    if from.is_none() && (!filter.is_empty() || order_by.is_some()) {
        return Err(syntax_error("WHERE and ORDER BY need a FROM clause"));
    }

    let items = select
        .projection
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::Select {
        items,
        from,
        filter,
        order_by,
        limit,
    })
}

fn convert_order_by(order_by: Option<sql_ast::OrderBy>) -> Result<Option<(String, bool)>> {
    let Some(order_by) = order_by else {
        return Ok(None);
    };
    let sql_ast::OrderByKind::Expressions(mut exprs) = order_by.kind else {
        return Err(unsupported("ORDER BY ALL"));
    };
    if exprs.len() != 1 {
        return Err(unsupported("ORDER BY with several keys"));
    }
    let Some(order) = exprs.pop() else {
        return Ok(None);
    };
    let descending = order.options.asc.map(|asc| !asc).unwrap_or(false);
    match convert_expr(order.expr)? {
        Expr::Column(column) => Ok(Some((column, descending))),
        _ => Err(unsupported("ORDER BY on an expression")),
    }
}

fn convert_limit(limit_clause: Option<sql_ast::LimitClause>) -> Result<Option<usize>> {
    let limit = match limit_clause {
        None => return Ok(None),
        Some(sql_ast::LimitClause::LimitOffset { limit: None, .. }) => return Ok(None),
        Some(sql_ast::LimitClause::LimitOffset {
            limit: Some(limit), ..
        }) => limit,
        Some(sql_ast::LimitClause::OffsetCommaLimit { limit, .. }) => limit,
    };
    match convert_expr(limit)? {
        Expr::Literal(Value::Integer(n)) if n >= 0 => Ok(Some(n as usize)),
        _ => Err(unsupported("a non-constant LIMIT")),
    }
}

fn convert_returning(returning: Option<Vec<sql_ast::SelectItem>>) -> Result<Option<Vec<Projection>>> {
    returning
        .map(|items| items.into_iter().map(convert_select_item).collect())
        .transpose()
}

fn convert_select_item(item: sql_ast::SelectItem) -> Result<Projection> {
    let (expr, alias) = match item {
        sql_ast::SelectItem::Wildcard(_) => return Ok(Projection::Wildcard),
        sql_ast::SelectItem::UnnamedExpr(expr) => (expr, None),
        sql_ast::SelectItem::ExprWithAlias { expr, alias } => (expr, Some(ident_name(&alias))),
        other => return Err(unsupported(format!("select item {}", other))),
    };

    if is_count_star(&expr) {
        return Ok(Projection::Count {
            name: alias.unwrap_or_else(|| "count".to_string()),
        });
    }

    let expr = convert_expr(expr)?;
    let name = alias.unwrap_or_else(|| default_name(&expr));
    Ok(Projection::Expr { expr, name })
}

fn is_count_star(expr: &sql_ast::Expr) -> bool {
    let sql_ast::Expr::Function(func) = expr else {
        return false;
    };
    if !func.name.to_string().eq_ignore_ascii_case("count") {
        return false;
    }
    let sql_ast::FunctionArguments::List(list) = &func.args else {
        return false;
    };
    match list.args.as_slice() {
        [sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Wildcard)] => true,
        [sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Expr(sql_ast::Expr::Value(v)))] => {
            matches!(&v.value, sql_ast::Value::Number(n, _) if n == "1")
        }
        _ => false,
    }
}

/// Flattens `a = x AND b = y` into conjuncts.
fn convert_filter(selection: Option<sql_ast::Expr>) -> Result<Vec<Filter>> {
    let mut filter = Vec::new();
    if let Some(expr) = selection {
        collect_conjuncts(expr, &mut filter)?;
    }
    Ok(filter)
}

fn collect_conjuncts(expr: sql_ast::Expr, out: &mut Vec<Filter>) -> Result<()> {
    match expr {
        sql_ast::Expr::Nested(inner) => collect_conjuncts(*inner, out),
        sql_ast::Expr::BinaryOp {
            left,
            op: sql_ast::BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(*left, out)?;
            collect_conjuncts(*right, out)
        }
        sql_ast::Expr::BinaryOp {
            left,
            op: sql_ast::BinaryOperator::Eq,
            right,
        } => match convert_expr(*left)? {
            Expr::Column(column) => {
                out.push(Filter {
                    column,
                    value: convert_expr(*right)?,
                });
                Ok(())
            }
            _ => Err(unsupported("a comparison whose left side is not a column")),
        },
        other => Err(unsupported(format!("condition {}", other))),
    }
}

fn convert_expr(expr: sql_ast::Expr) -> Result<Expr> {
    match expr {
        sql_ast::Expr::Identifier(ident) => Ok(Expr::Column(ident_name(&ident))),
        sql_ast::Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| Expr::Column(ident_name(ident)))
            .ok_or_else(|| syntax_error("empty identifier")),
        sql_ast::Expr::Value(value) => convert_value(value.value),
        sql_ast::Expr::Nested(inner) => convert_expr(*inner),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match convert_expr(*expr)? {
            Expr::Literal(Value::Integer(i)) => Ok(Expr::Literal(Value::Integer(-i))),
            Expr::Literal(Value::Float(f)) => Ok(Expr::Literal(Value::Float(-f))),
            _ => Err(unsupported("unary minus on a non-literal")),
        },
        sql_ast::Expr::Cast {
            expr, data_type, ..
        } => Ok(Expr::Cast(Box::new(convert_expr(*expr)?), type_name(&data_type))),
        sql_ast::Expr::Function(func) => convert_function(func),
        other => Err(unsupported(format!("expression {}", other))),
    }
}

fn convert_value(value: sql_ast::Value) -> Result<Expr> {
    match value {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Expr::Literal(Value::Integer(i)))
            } else {
                n.parse::<f64>()
                    .map(|f| Expr::Literal(Value::Float(f)))
                    .map_err(|_| syntax_error(format!("invalid number \"{}\"", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) => Ok(Expr::Literal(Value::Text(s))),
        sql_ast::Value::Boolean(b) => Ok(Expr::Literal(Value::Boolean(b))),
        sql_ast::Value::Null => Ok(Expr::Literal(Value::Null)),
        sql_ast::Value::Placeholder(p) => match p.strip_prefix('$').map(str::parse::<usize>) {
            Some(Ok(n)) if n > 0 => Ok(Expr::Param(n)),
            _ => Err(syntax_error(format!("invalid parameter \"{}\"", p))),
        },
        other => Err(unsupported(format!("literal {}", other))),
    }
}

fn convert_function(func: sql_ast::Function) -> Result<Expr> {
    let name = func.name.to_string().to_lowercase();
    let mut args = match func.args {
        sql_ast::FunctionArguments::None => Vec::new(),
        sql_ast::FunctionArguments::List(list) => list
            .args
            .into_iter()
            .map(|arg| match arg {
                sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Expr(e)) => convert_expr(e),
                other => Err(unsupported(format!("function argument {}", other))),
            })
            .collect::<Result<Vec<_>>>()?,
        sql_ast::FunctionArguments::Subquery(_) => {
            return Err(unsupported("a subquery argument"));
        }
    };

    match (name.as_str(), args.len()) {
        ("now" | "transaction_timestamp" | "current_timestamp", 0) => Ok(Expr::Now),
        ("current_database", 0) => Ok(Expr::CurrentDatabase),
        ("current_setting", 1) => match args.pop() {
            Some(Expr::Literal(Value::Text(setting))) => {
                Ok(Expr::CurrentSetting(setting.to_lowercase()))
            }
            _ => Err(unsupported("current_setting with a non-literal name")),
        },
        ("pg_sleep", 1) => match args.pop() {
            Some(arg) => Ok(Expr::Sleep(Box::new(arg))),
            None => Err(syntax_error("pg_sleep needs an argument")),
        },
        _ => Err(unsupported(format!("function {}", name))),
    }
}

/// Lower-case type name without length modifiers, e.g. `VARCHAR(10)` -> `varchar`.
fn type_name(data_type: &sql_ast::DataType) -> String {
    let name = data_type.to_string().to_lowercase();
    match name.split_once('(') {
        Some((base, _)) => base.trim().to_string(),
        None => name,
    }
}

fn default_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(name) => name.clone(),
        Expr::Cast(inner, ty) => match inner.as_ref() {
            Expr::Column(name) => name.clone(),
            Expr::Literal(_) | Expr::Param(_) => ty.clone(),
            other => default_name(other),
        },
        Expr::Now => "now".into(),
        Expr::CurrentDatabase => "current_database".into(),
        Expr::CurrentSetting(_) => "current_setting".into(),
        Expr::Sleep(_) => "pg_sleep".into(),
        Expr::Literal(_) | Expr::Param(_) => "?column?".into(),
    }
}

/// Unquoted identifiers fold to lower case.
fn ident_name(ident: &sql_ast::Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn normalize_name(raw: &str) -> String {
    let last = raw.rsplit('.').next().unwrap_or(raw).trim();
    match last.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(quoted) => quoted.to_string(),
        None => last.to_lowercase(),
    }
}

fn table_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|part| normalize_name(&part.to_string()))
        .ok_or_else(|| syntax_error("invalid name"))
}

fn relation_name(factor: sql_ast::TableFactor) -> Result<String> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => table_name(&name),
        other => Err(unsupported(format!("table reference {}", other))),
    }
}
