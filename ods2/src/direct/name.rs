//! 文件名的语法检查与通配匹配

use crate::{Error, Result};

/// 版本号`*`：所有版本
pub const VERSION_ALL: i32 = 32768;
/// 文件名或类型的最大长度
pub const MAX_SEGMENT: usize = 40;
/// 最大的字面版本号
pub const MAX_VERSION: i32 = 32767;

/// 分解后的文件名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSpec {
    /// 大写的 `名称.类型`，总是含有一个点
    pub name: String,
    /// 0 为最高版本，负数为倒数第 N 个版本，[`VERSION_ALL`] 为全部版本
    pub version: i32,
    /// 名称中含通配符，或版本为`*`
    pub wild: bool,
}

impl NameSpec {
    /// 名称中第一个通配符之前的部分
    pub fn literal_prefix(&self) -> &str {
        let end = self.name.find(['*', '%']).unwrap_or(self.name.len());
        &self.name[..end]
    }

    pub fn has_wild_name(&self) -> bool {
        self.name.contains(['*', '%'])
    }
}

/// 检查并分解 `名称.类型;版本`
///
/// 版本也可以用第二个点分隔。点超过两个、某一段超过 40 个字符、
/// 或含有 `[` `]` `:` 以及不可打印字符时报 [`Error::BadFileName`]。
pub fn name_check(spec: &str) -> Result<NameSpec> {
    if spec
        .chars()
        .any(|c| !c.is_ascii_graphic() || matches!(c, '[' | ']' | ':'))
    {
        return Err(Error::BadFileName);
    }

    let (body, version) = match spec.split_once(';') {
        Some((body, version)) => (body, Some(version)),
        None => match spec.match_indices('.').nth(1) {
            Some((at, _)) => (&spec[..at], Some(&spec[at + 1..])),
            None => (spec, None),
        },
    };
    if body.contains(';') || version.is_some_and(|v| v.contains(['.', ';'])) {
        return Err(Error::BadFileName);
    }

    let (name, ext) = body.split_once('.').unwrap_or((body, ""));
    if ext.contains('.')
        || name.len() > MAX_SEGMENT
        || ext.len() > MAX_SEGMENT
        || (name.is_empty() && ext.is_empty())
    {
        return Err(Error::BadFileName);
    }

    let version = match version.unwrap_or("") {
        "" => 0,
        "*" => VERSION_ALL,
        v => {
            let n: i32 = v.parse().map_err(|_| Error::BadFileName)?;
            if !(-MAX_VERSION..=MAX_VERSION).contains(&n) {
                return Err(Error::BadFileName);
            }
            n
        }
    };

    let name = format!("{name}.{ext}").to_ascii_uppercase();
    let wild = name.contains(['*', '%']) || version == VERSION_ALL;
    Ok(NameSpec {
        name,
        version,
        wild,
    })
}

/// 目录项名称与匹配式的关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// 名称排在所有可能匹配的名称之前
    Less,
    Equal,
    /// 名称排在所有可能匹配的名称之后，目录扫描可以停止
    Greater,
    /// 不匹配，但后面仍可能有匹配的名称
    NotEqual,
}

/// 不区分大小写地比较`entry`与匹配式`spec`
///
/// `*` 匹配任意多个字符（含零个），`%` 恰好匹配一个。
pub fn name_match(spec: &[u8], entry: &[u8]) -> Match {
    let prefix = spec
        .iter()
        .position(|c| matches!(c, b'*' | b'%'))
        .unwrap_or(spec.len());

    for i in 0..prefix {
        let Some(&e) = entry.get(i) else {
            return Match::Less;
        };
        match e.to_ascii_uppercase().cmp(&spec[i].to_ascii_uppercase()) {
            std::cmp::Ordering::Less => return Match::Less,
            std::cmp::Ordering::Greater => return Match::Greater,
            std::cmp::Ordering::Equal => {}
        }
    }

    if prefix == spec.len() {
        return if entry.len() == spec.len() {
            Match::Equal
        } else {
            Match::Greater
        };
    }
    if glob(&spec[prefix..], &entry[prefix..]) {
        Match::Equal
    } else {
        Match::NotEqual
    }
}

/// 回溯式的通配匹配，只记住最近一个`*`的位置
fn glob(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'%' || c.eq_ignore_ascii_case(&text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
