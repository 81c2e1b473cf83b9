//! 5字段CRON表达式解析与触发时间计算
//!
//! 字段顺序：分 时 日 月 周。支持 `*`、区间 `a-b`、步长 `*/n` 与
//! `a-b/n`、列表 `a,b,c`、月份与星期的3字母英文名，以及
//! `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly`/`@reboot` 简写。
//! 所有解析错误在任务创建时报出，非法表达式不会进入队列。

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::errors::{SchedulerError, SchedulerResult};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// 一条调度表达式
///
/// `@reboot`在解析层就与普通表达式分开：它只在协调器启动时触发
/// 一次，没有"下一次执行时间"的概念。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronLine {
    Reboot,
    Schedule(CronSchedule),
}

/// 已解析的5字段表达式，按位掩码存储每个字段的允许取值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn invalid(expr: &str, message: String) -> SchedulerError {
    SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message,
    }
}

impl CronLine {
    /// 解析表达式，错误在创建时报出而不是触发时
    pub fn parse(expr: &str) -> SchedulerResult<CronLine> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid(expr, "表达式为空".to_string()));
        }

        let expanded = match trimmed {
            "@reboot" => return Ok(CronLine::Reboot),
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other if other.starts_with('@') => {
                return Err(invalid(expr, format!("未知的简写: {other}")));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(expr, format!("需要5个字段，实际{}个", fields.len())));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59, &[]).map_err(|m| invalid(expr, m))?;
        let (hours, _) = parse_field(fields[1], 0, 23, &[]).map_err(|m| invalid(expr, m))?;
        let (days_of_month, dom_restricted) =
            parse_field(fields[2], 1, 31, &[]).map_err(|m| invalid(expr, m))?;
        let (months, _) =
            parse_field(fields[3], 1, 12, &MONTH_NAMES).map_err(|m| invalid(expr, m))?;
        // 星期允许0-7，7与0都表示周日
        let (dow_raw, dow_restricted) =
            parse_field(fields[4], 0, 7, &DOW_NAMES).map_err(|m| invalid(expr, m))?;
        let mut days_of_week = dow_raw & 0x7F;
        if dow_raw & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(CronLine::Schedule(CronSchedule {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        }))
    }
}

impl CronSchedule {
    /// 严格大于`after`的第一个触发时间
    ///
    /// 对于永远无法满足的日期组合（如2月30日）返回None；
    /// 搜索上限为5年。
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after) + Duration::minutes(1);
        let limit = after + Duration::days(366 * 5);

        loop {
            if t > limit {
                return None;
            }
            if !self.month_matches(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t) {
                let next_day = t.date_naive().succ_opt()?;
                t = Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.hour_matches(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute_matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
    }

    /// 从`after`之后的触发时间无穷迭代器
    pub fn iter_after(&self, after: DateTime<Utc>) -> FireTimes {
        FireTimes {
            schedule: self.clone(),
            cursor: after,
        }
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn month_matches(&self, month: u32) -> bool {
        self.months & (1 << month) != 0
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = self.days_of_month & (1 << t.date_naive().day()) != 0;
        let dow_ok = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        // 日与周同时受限时按传统crontab取并集，否则取交集
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}

/// `CronSchedule::iter_after`返回的触发时间迭代器
pub struct FireTimes {
    schedule: CronSchedule,
    cursor: DateTime<Utc>,
}

impl Iterator for FireTimes {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<DateTime<Utc>> {
        let next = self.schedule.next_after(self.cursor)?;
        self.cursor = next;
        Some(next)
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("秒与纳秒归零不会越界")
}

/// 解析单个字段，返回位掩码与"是否受限"（字段不是裸`*`）
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<(u64, bool), String> {
    if field.is_empty() {
        return Err("字段为空".to_string());
    }
    let mut mask: u64 = 0;
    for item in field.split(',') {
        let (range_part, step) = match item.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| format!("无效的步长: {step_str}"))?;
                if step == 0 {
                    return Err(format!("步长不能为0: {item}"));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (
                parse_value(a, min, max, names)?,
                parse_value(b, min, max, names)?,
            )
        } else {
            let value = parse_value(range_part, min, max, names)?;
            // 单值带步长按 v-max/step 处理，与传统crontab一致
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if lo > hi {
            return Err(format!("范围起点大于终点: {item}"));
        }
        let mut value = lo;
        while value <= hi {
            mask |= 1u64 << value;
            value += step;
        }
    }
    Ok((mask, field != "*"))
}

fn parse_value(s: &str, min: u32, max: u32, names: &[&str]) -> Result<u32, String> {
    let value = if let Ok(number) = s.parse::<u32>() {
        number
    } else {
        let lower = s.to_ascii_lowercase();
        let index = names
            .iter()
            .position(|name| *name == lower)
            .ok_or_else(|| format!("无法识别的名称: {s}"))?;
        // 名称表从字段最小值起编号（月份从1，星期从0）
        min + index as u32
    };
    if value < min || value > max {
        return Err(format!("取值越界: {s} (允许 {min}-{max})"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .unwrap()
    }

    fn schedule(expr: &str) -> CronSchedule {
        match CronLine::parse(expr).unwrap() {
            CronLine::Schedule(s) => s,
            CronLine::Reboot => panic!("不应是@reboot"),
        }
    }

    #[test]
    fn test_every_minute() {
        let s = schedule("* * * * *");
        let t = at(2026, 8, 7, 12, 30, 15);
        assert_eq!(s.next_after(t), Some(at(2026, 8, 7, 12, 31, 0)));
    }

    #[test]
    fn test_strictly_greater_at_exact_fire_time() {
        let s = schedule("0 * * * *");
        // 正好落在触发时间上，下一次必须严格大于
        let t = at(2026, 8, 7, 12, 0, 0);
        assert_eq!(s.next_after(t), Some(at(2026, 8, 7, 13, 0, 0)));
    }

    #[test]
    fn test_deterministic() {
        let s = schedule("*/15 9-17 * * mon-fri");
        let t = at(2026, 8, 7, 3, 7, 0);
        assert_eq!(s.next_after(t), s.next_after(t));
    }

    #[test]
    fn test_step_and_range() {
        let s = schedule("10-30/10 * * * *");
        let t = at(2026, 8, 7, 12, 0, 0);
        assert_eq!(s.next_after(t), Some(at(2026, 8, 7, 12, 10, 0)));
        assert_eq!(
            s.next_after(at(2026, 8, 7, 12, 10, 0)),
            Some(at(2026, 8, 7, 12, 20, 0))
        );
        assert_eq!(
            s.next_after(at(2026, 8, 7, 12, 30, 0)),
            Some(at(2026, 8, 7, 13, 10, 0))
        );
    }

    #[test]
    fn test_list() {
        let s = schedule("0 6,18 * * *");
        assert_eq!(
            s.next_after(at(2026, 8, 7, 7, 0, 0)),
            Some(at(2026, 8, 7, 18, 0, 0))
        );
        assert_eq!(
            s.next_after(at(2026, 8, 7, 19, 0, 0)),
            Some(at(2026, 8, 8, 6, 0, 0))
        );
    }

    #[test]
    fn test_month_and_dow_names() {
        let s = schedule("0 12 * jan mon");
        // 2027-01-04 是一月的第一个周一
        assert_eq!(
            s.next_after(at(2026, 8, 7, 0, 0, 0)),
            Some(at(2027, 1, 4, 12, 0, 0))
        );
    }

    #[test]
    fn test_sunday_as_seven() {
        let a = schedule("0 0 * * 0");
        let b = schedule("0 0 * * 7");
        let t = at(2026, 8, 7, 0, 0, 0);
        assert_eq!(a.next_after(t), b.next_after(t));
        // 2026-08-09 是周日
        assert_eq!(a.next_after(t), Some(at(2026, 8, 9, 0, 0, 0)));
    }

    #[test]
    fn test_dom_dow_union_when_both_restricted() {
        // 13号或周五，两者都触发
        let s = schedule("0 0 13 * fri");
        // 2021-08-13 是周五，之前的周五是 8月6日
        assert_eq!(
            s.next_after(at(2021, 8, 3, 0, 0, 0)),
            Some(at(2021, 8, 6, 0, 0, 0))
        );
        assert_eq!(
            s.next_after(at(2021, 8, 6, 0, 0, 0)),
            Some(at(2021, 8, 13, 0, 0, 0))
        );
        // 仅日受限时不并集
        let only_dom = schedule("0 0 13 * *");
        assert_eq!(
            only_dom.next_after(at(2021, 8, 3, 0, 0, 0)),
            Some(at(2021, 8, 13, 0, 0, 0))
        );
    }

    #[test]
    fn test_month_rollover() {
        let s = schedule("30 4 1 * *");
        assert_eq!(
            s.next_after(at(2026, 12, 15, 0, 0, 0)),
            Some(at(2027, 1, 1, 4, 30, 0))
        );
    }

    #[test]
    fn test_impossible_date_returns_none() {
        let s = schedule("0 0 30 2 *");
        assert_eq!(s.next_after(at(2026, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_leap_day() {
        let s = schedule("0 0 29 2 *");
        assert_eq!(
            s.next_after(at(2026, 1, 1, 0, 0, 0)),
            Some(at(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn test_shorthands() {
        assert_eq!(
            CronLine::parse("@hourly").unwrap(),
            CronLine::parse("0 * * * *").unwrap()
        );
        assert_eq!(
            CronLine::parse("@daily").unwrap(),
            CronLine::parse("0 0 * * *").unwrap()
        );
        assert_eq!(
            CronLine::parse("@weekly").unwrap(),
            CronLine::parse("0 0 * * 0").unwrap()
        );
        assert_eq!(
            CronLine::parse("@monthly").unwrap(),
            CronLine::parse("0 0 1 * *").unwrap()
        );
        assert_eq!(
            CronLine::parse("@yearly").unwrap(),
            CronLine::parse("0 0 1 1 *").unwrap()
        );
        assert_eq!(CronLine::parse("@reboot").unwrap(), CronLine::Reboot);
    }

    #[test]
    fn test_parse_errors() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "* * * * xyz",
            "*/0 * * * *",
            "30-10 * * * *",
            "@fortnightly",
        ] {
            assert!(
                matches!(
                    CronLine::parse(expr),
                    Err(SchedulerError::InvalidCron { .. })
                ),
                "应当拒绝: {expr:?}"
            );
        }
    }

    #[test]
    fn test_iter_after_monotonic() {
        let s = schedule("*/20 * * * *");
        let start = at(2026, 8, 7, 10, 0, 0);
        let times: Vec<_> = s.iter_after(start).take(4).collect();
        assert_eq!(
            times,
            vec![
                at(2026, 8, 7, 10, 20, 0),
                at(2026, 8, 7, 10, 40, 0),
                at(2026, 8, 7, 11, 0, 0),
                at(2026, 8, 7, 11, 20, 0),
            ]
        );
    }
}
