//! Weighted random instance selection.

use rand::Rng;

use micra_core::instance::Instance;

/// Pick one instance by load-balancing weight.
pub fn weighted_pick(instances: &[Instance]) -> Option<Instance> {
    match instances.len() {
        0 => return None,
        1 => return Some(instances[0].clone()),
        _ => {}
    }

    let total_weight: f64 = instances.iter().map(|i| i.weight.max(0.0)).sum();
    if total_weight <= 0.0 {
        return Some(instances[0].clone());
    }

    let roll = rand::thread_rng().gen_range(0.0..total_weight);
    let mut upper = 0.0;
    for instance in instances {
        upper += instance.weight.max(0.0);
        if roll < upper {
            return Some(instance.clone());
        }
    }
    Some(instances[0].clone())
}

/// Selection policy of `get_instance`: weighted among healthy,
/// unhealthy pool only as a fallback when allowed.
pub fn pick_instance(instances: &[Instance], healthy_only: bool) -> Option<Instance> {
    let (healthy, unhealthy): (Vec<Instance>, Vec<Instance>) =
        instances.iter().cloned().partition(|i| i.healthy);

    if !healthy.is_empty() {
        return weighted_pick(&healthy);
    }
    if healthy_only {
        return None;
    }
    weighted_pick(&unhealthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(ip: &str, weight: f64, healthy: bool) -> Instance {
        Instance {
            weight,
            healthy,
            ..Instance::new(ip, 8080)
        }
    }

    #[test]
    fn empty_pool_is_none() {
        assert!(weighted_pick(&[]).is_none());
        assert!(pick_instance(&[], false).is_none());
    }

    #[test]
    fn single_instance_always_picked() {
        let pool = vec![instance("10.0.0.1", 1.0, true)];
        assert_eq!(weighted_pick(&pool).unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn zero_weight_pool_still_picks() {
        let pool = vec![
            instance("10.0.0.1", 0.0, true),
            instance("10.0.0.2", 0.0, true),
        ];
        assert!(weighted_pick(&pool).is_some());
    }

    #[test]
    fn heavy_weight_dominates() {
        let pool = vec![
            instance("10.0.0.1", 1000.0, true),
            instance("10.0.0.2", 0.001, true),
        ];
        let mut first = 0;
        for _ in 0..200 {
            if weighted_pick(&pool).unwrap().ip == "10.0.0.1" {
                first += 1;
            }
        }
        assert!(first > 190, "weighted pick chose the heavy node {} times", first);
    }

    #[test]
    fn healthy_preferred_over_unhealthy() {
        let pool = vec![
            instance("10.0.0.1", 1.0, false),
            instance("10.0.0.2", 1.0, true),
        ];
        for _ in 0..20 {
            assert_eq!(pick_instance(&pool, false).unwrap().ip, "10.0.0.2");
        }
    }

    #[test]
    fn unhealthy_fallback_only_when_allowed() {
        let pool = vec![instance("10.0.0.1", 1.0, false)];
        assert!(pick_instance(&pool, true).is_none());
        assert_eq!(pick_instance(&pool, false).unwrap().ip, "10.0.0.1");
    }
}
