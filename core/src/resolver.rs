use super::model::AccountId;
use super::policy::{Overflow, ReactionPolicy};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

/// 为每个可用账号分配一个反应表情
///
/// 随机模式每个账号独立随机；手动模式按数量展开后打乱，按顺序分配，
/// 多出的账号按溢出策略随机补充或不分配。
pub fn assign_reactions<R: Rng + ?Sized>(
    rng: &mut R,
    policy: &ReactionPolicy,
    eligible: &[AccountId],
) -> Vec<(AccountId, String)> {
    match policy {
        ReactionPolicy::Random { emojis } => eligible
            .iter()
            .filter_map(|account| emojis.choose(rng).map(|e| (*account, e.clone())))
            .collect(),
        ReactionPolicy::Manual { overflow, .. } => {
            let assigned = policy.shuffled_multiset(rng);
            let keys = policy.emojis();
            let mut out = Vec::with_capacity(eligible.len());
            for (idx, account) in eligible.iter().enumerate() {
                let emoji = match assigned.get(idx) {
                    Some(emoji) => emoji.clone(),
                    None if *overflow == Overflow::FillRandom => match keys.choose(rng) {
                        Some(emoji) => emoji.clone(),
                        None => continue,
                    },
                    None => continue,
                };
                out.push((*account, emoji));
            }
            out
        }
    }
}

/// 浏览账号抽样：数量在 `[min, max]` 内均匀选取，不超过订阅数
pub fn sample_views<R: Rng + ?Sized>(
    rng: &mut R,
    subscribed: &[AccountId],
    range: (usize, usize),
) -> Vec<AccountId> {
    let (min, max) = if range.0 <= range.1 {
        range
    } else {
        (range.1, range.0)
    };
    let wanted = rng.gen_range(min..=max).min(subscribed.len());
    subscribed.choose_multiple(rng, wanted).copied().collect()
}

/// 评论账号：打乱后取前 `1..=min(N, max_accounts)` 个
pub fn select_comment_accounts<R: Rng + ?Sized>(
    rng: &mut R,
    subscribed: &[AccountId],
    max_accounts: usize,
) -> Vec<AccountId> {
    let upper = subscribed.len().min(max_accounts);
    if upper == 0 {
        return Vec::new();
    }
    let take = rng.gen_range(1..=upper);
    let mut shuffled = subscribed.to_vec();
    shuffled.shuffle(rng);
    shuffled.truncate(take);
    shuffled
}

/// 为评论账号分配文本
///
/// 批次先无重复地抽样到账号数；每个账号优先取同位置的文本，
/// 已用过时取批次中第一条未用的，都没有则跳过该账号。
pub fn assign_comments<R, F>(
    rng: &mut R,
    accounts: &[AccountId],
    batch: &[String],
    is_used: F,
) -> Vec<(usize, AccountId, String)>
where
    R: Rng + ?Sized,
    F: Fn(&str) -> bool,
{
    let mut sampled: Vec<&String> = batch
        .iter()
        .choose_multiple(rng, accounts.len().min(batch.len()));
    sampled.shuffle(rng);

    let mut taken: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for (idx, account) in accounts.iter().enumerate() {
        let positional = sampled
            .get(idx)
            .map(|s| s.as_str())
            .filter(|text| !is_used(*text) && !taken.contains(*text));
        let replacement = || {
            sampled
                .iter()
                .map(|s| s.as_str())
                .find(|text| !is_used(*text) && !taken.contains(*text))
        };
        let Some(text) = positional.or_else(replacement) else {
            continue;
        };
        taken.insert(text);
        out.push((idx, *account, text.to_string()));
    }
    out
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollChoiceError {
    #[error("投票没有选项")]
    NoOptions,
    #[error("无法解析选项序号: {0}")]
    BadIndex(String),
    #[error("选项序号超出范围: {0}")]
    OutOfRange(usize),
    #[error("单选投票只能选择一个选项")]
    SingleChoice,
}

/// 解析投票选项
///
/// `random` 随机选择（多选投票为随机非空子集），否则为逗号分隔的 1 起始序号。
pub fn choose_poll_options<R: Rng + ?Sized>(
    rng: &mut R,
    choice: &str,
    options: &[Vec<u8>],
    multiple_choice: bool,
) -> Result<Vec<Vec<u8>>, PollChoiceError> {
    if options.is_empty() {
        return Err(PollChoiceError::NoOptions);
    }

    let choice = choice.trim();
    if choice.eq_ignore_ascii_case("random") {
        if !multiple_choice {
            return Ok(options.choose(rng).into_iter().cloned().collect());
        }
        let count = rng.gen_range(1..=options.len());
        let mut picked: Vec<usize> = (0..options.len()).choose_multiple(rng, count);
        picked.sort_unstable();
        return Ok(picked.into_iter().map(|i| options[i].clone()).collect());
    }

    let mut indices = Vec::new();
    for part in choice.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let idx: usize = part
            .parse()
            .map_err(|_| PollChoiceError::BadIndex(part.to_string()))?;
        if idx == 0 || idx > options.len() {
            return Err(PollChoiceError::OutOfRange(idx));
        }
        if !indices.contains(&idx) {
            indices.push(idx);
        }
    }

    if indices.is_empty() {
        return Err(PollChoiceError::BadIndex(choice.to_string()));
    }
    if indices.len() > 1 && !multiple_choice {
        return Err(PollChoiceError::SingleChoice);
    }

    Ok(indices.into_iter().map(|i| options[i - 1].clone()).collect())
}
